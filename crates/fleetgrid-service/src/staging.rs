//! Working directory staging.
//!
//! Everything that touches a service's working directory on disk lives
//! here: the `.wrapper` directory and TLS material, templates, remote
//! inclusions, the process configuration file, deployments back into
//! template storage and the deletion rules applied after a stop.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use fleetgrid_cluster::send_request;
use fleetgrid_state::{
    ServiceDeployment, ServiceRemoteInclusion, ServiceSnapshot, ServiceTemplate,
};

use crate::config::SslConfig;
use crate::error::{io_err, ServiceError, ServiceResult};

/// Reserved subdirectory of every working directory.
pub const WRAPPER_DIR: &str = ".wrapper";
/// Process configuration written before each start.
pub const WRAPPER_CONFIG: &str = "wrapper.json";

const INCLUSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Join a relative path onto `base`, refusing absolute paths and `..`.
pub fn safe_join(base: &Path, relative: &str) -> ServiceResult<PathBuf> {
    let rel = Path::new(relative);
    let clean = rel
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if relative.is_empty() || !clean {
        return Err(ServiceError::UnsafePath(relative.to_string()));
    }
    Ok(base.join(rel))
}

/// Create the working directory and its `.wrapper` subdirectory.
pub fn prepare_directory(directory: &Path) -> ServiceResult<PathBuf> {
    let wrapper = directory.join(WRAPPER_DIR);
    std::fs::create_dir_all(&wrapper).map_err(io_err(&wrapper))?;
    Ok(wrapper)
}

/// Copy the configured TLS files into `.wrapper`. Missing source files
/// are skipped. Returns how many files were copied.
pub fn stage_ssl(ssl: &SslConfig, wrapper: &Path) -> ServiceResult<usize> {
    if !ssl.enabled {
        return Ok(0);
    }
    let mut copied = 0;
    for (source, target) in [
        (&ssl.certificate_path, "certificate"),
        (&ssl.private_key_path, "privateKey"),
        (&ssl.trust_certificate_path, "trustCertificate"),
    ] {
        let Some(source) = source else { continue };
        if !source.exists() {
            debug!(?source, "ssl file missing, skipped");
            continue;
        }
        let dest = wrapper.join(target);
        std::fs::copy(source, &dest).map_err(io_err(&dest))?;
        copied += 1;
    }
    Ok(copied)
}

/// Recursively copy `from` into `to`, skipping paths for which `skip`
/// returns true (relative to `from`). Returns the number of files copied.
fn copy_tree(from: &Path, to: &Path, skip: impl Fn(&Path) -> bool) -> ServiceResult<usize> {
    let mut copied = 0;
    let walker = WalkDir::new(from)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(from)
                .map(|rel| !skip(rel))
                .unwrap_or(true)
        });

    for entry in walker {
        let entry = entry.map_err(|e| ServiceError::Io {
            path: from.to_path_buf(),
            source: e.into(),
        })?;
        let Ok(rel) = entry.path().strip_prefix(from) else {
            continue;
        };
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest).map_err(io_err(&dest))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
            std::fs::copy(entry.path(), &dest).map_err(io_err(&dest))?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Copy a template from local storage into the working directory.
/// A template that does not exist yet copies nothing.
pub fn copy_template(template_root: &Path, template: &ServiceTemplate, directory: &Path) -> ServiceResult<usize> {
    let source = template_root.join(&template.prefix).join(&template.name);
    if !source.is_dir() {
        debug!(%template, ?source, "template not found, skipped");
        return Ok(0);
    }
    let copied = copy_tree(&source, directory, |_| false)?;
    debug!(%template, copied, "template copied");
    Ok(copied)
}

/// Copy the working directory back into a template, leaving out
/// `.wrapper` and the deployment's excludes.
pub fn deploy(directory: &Path, template_root: &Path, deployment: &ServiceDeployment) -> ServiceResult<usize> {
    let target = template_root
        .join(&deployment.template.prefix)
        .join(&deployment.template.name);
    let excludes: Vec<PathBuf> = deployment.excludes.iter().map(PathBuf::from).collect();
    let copied = copy_tree(directory, &target, |rel| {
        rel.starts_with(WRAPPER_DIR) || excludes.iter().any(|ex| rel.starts_with(ex))
    })?;
    debug!(template = %deployment.template, copied, "deployment written");
    Ok(copied)
}

/// Fetch a remote inclusion into the working directory.
pub async fn fetch_inclusion(inclusion: &ServiceRemoteInclusion, directory: &Path) -> ServiceResult<()> {
    let dest = safe_join(directory, &inclusion.destination)?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let fail = |reason: String| ServiceError::Inclusion {
        url: inclusion.url.clone(),
        reason,
    };

    if let Some(path) = inclusion.url.strip_prefix("file://") {
        tokio::fs::copy(path, &dest)
            .await
            .map_err(|e| fail(e.to_string()))?;
    } else if let Some(rest) = inclusion.url.strip_prefix("http://") {
        let body = tokio::time::timeout(INCLUSION_TIMEOUT, http_get(rest))
            .await
            .map_err(|_| fail(format!("timed out after {INCLUSION_TIMEOUT:?}")))?
            .map_err(fail)?;
        tokio::fs::write(&dest, &body).await.map_err(io_err(&dest))?;
    } else {
        return Err(fail("unsupported url scheme".to_string()));
    }

    debug!(url = %inclusion.url, ?dest, "inclusion fetched");
    Ok(())
}

/// GET `host[:port]/path` over plain HTTP/1.1.
async fn http_get(authority_and_path: &str) -> Result<Vec<u8>, String> {
    let (authority, path) = match authority_and_path.find('/') {
        Some(i) => authority_and_path.split_at(i),
        None => (authority_and_path, "/"),
    };
    let address = if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{authority}:80")
    };

    let (status, body) = send_request(&address, http::Method::GET, path, None)
        .await
        .map_err(|e| e.to_string())?;
    if !status.is_success() {
        return Err(format!("server answered {status}"));
    }
    Ok(body.to_vec())
}

/// Process configuration handed to the service through
/// `.wrapper/wrapper.json`.
#[derive(Debug, Serialize)]
struct WrapperConfig<'a> {
    connect_key: String,
    snapshot: &'a ServiceSnapshot,
}

pub fn write_wrapper_config(directory: &Path, snapshot: &ServiceSnapshot) -> ServiceResult<PathBuf> {
    let wrapper = prepare_directory(directory)?;
    let path = wrapper.join(WRAPPER_CONFIG);
    let config = WrapperConfig {
        connect_key: snapshot.unique_id().simple().to_string(),
        snapshot,
    };
    let content = serde_json::to_vec_pretty(&config)?;
    std::fs::write(&path, content).map_err(io_err(&path))?;
    Ok(path)
}

/// Remove the configured files after a stop. Unsafe or missing paths are
/// skipped. Returns how many entries were removed.
pub fn delete_after_stop(directory: &Path, paths: &[String]) -> usize {
    let mut removed = 0;
    for relative in paths {
        let path = match safe_join(directory, relative) {
            Ok(path) => path,
            Err(e) => {
                warn!(%relative, error = %e, "refusing to delete");
                continue;
            }
        };
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else if path.exists() {
            std::fs::remove_file(&path)
        } else {
            continue;
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => warn!(?path, error = %e, "failed to delete file after stop"),
        }
    }
    removed
}

pub fn remove_directory(directory: &Path) -> ServiceResult<()> {
    if directory.exists() {
        std::fs::remove_dir_all(directory).map_err(io_err(directory))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn safe_join_rejects_escapes() {
        let base = Path::new("/srv/lobby");
        assert_eq!(safe_join(base, "logs/latest.log").unwrap(), base.join("logs/latest.log"));
        assert!(safe_join(base, "../other").is_err());
        assert!(safe_join(base, "logs/../../x").is_err());
        assert!(safe_join(base, "/etc/passwd").is_err());
        assert!(safe_join(base, "").is_err());
    }

    #[test]
    fn ssl_files_are_staged_when_enabled() {
        let src = tempfile::tempdir().unwrap();
        let cert = src.path().join("cert.pem");
        fs::write(&cert, "CERT").unwrap();

        let dir = tempfile::tempdir().unwrap();
        let wrapper = prepare_directory(dir.path()).unwrap();

        let ssl = SslConfig {
            enabled: true,
            certificate_path: Some(cert),
            private_key_path: Some(src.path().join("missing.pem")),
            trust_certificate_path: None,
        };
        assert_eq!(stage_ssl(&ssl, &wrapper).unwrap(), 1);
        assert_eq!(fs::read_to_string(wrapper.join("certificate")).unwrap(), "CERT");
        assert!(!wrapper.join("privateKey").exists());

        let disabled = SslConfig::default();
        assert_eq!(stage_ssl(&disabled, &wrapper).unwrap(), 0);
    }

    #[test]
    fn template_copy_and_deploy_back() {
        let templates = tempfile::tempdir().unwrap();
        let source = templates.path().join("Lobby/default");
        fs::create_dir_all(source.join("plugins")).unwrap();
        fs::write(source.join("server.properties"), "motd=hi").unwrap();
        fs::write(source.join("plugins/a.jar"), "jar").unwrap();

        let work = tempfile::tempdir().unwrap();
        let template = ServiceTemplate::new("Lobby", "default");
        assert_eq!(copy_template(templates.path(), &template, work.path()).unwrap(), 2);
        assert!(work.path().join("plugins/a.jar").exists());

        prepare_directory(work.path()).unwrap();
        fs::write(work.path().join("world.dat"), "w").unwrap();
        fs::write(work.path().join("cache.tmp"), "c").unwrap();

        let deployment = ServiceDeployment {
            template: ServiceTemplate::new("Lobby", "saved"),
            excludes: vec!["cache.tmp".into()],
        };
        deploy(work.path(), templates.path(), &deployment).unwrap();
        let saved = templates.path().join("Lobby/saved");
        assert!(saved.join("world.dat").exists());
        assert!(saved.join("plugins/a.jar").exists());
        assert!(!saved.join("cache.tmp").exists());
        assert!(!saved.join(WRAPPER_DIR).exists());
    }

    #[test]
    fn missing_template_copies_nothing() {
        let templates = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let template = ServiceTemplate::new("Nope", "default");
        assert_eq!(copy_template(templates.path(), &template, work.path()).unwrap(), 0);
    }

    #[test]
    fn delete_after_stop_skips_unsafe_paths() {
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("keep"), "x").unwrap();

        let work = tempfile::tempdir().unwrap();
        fs::create_dir_all(work.path().join("logs")).unwrap();
        fs::write(work.path().join("logs/latest.log"), "x").unwrap();
        fs::write(work.path().join("session.lock"), "x").unwrap();

        let escape = format!("../{}/keep", outside.path().file_name().unwrap().to_string_lossy());
        let removed = delete_after_stop(
            work.path(),
            &["logs".into(), "session.lock".into(), "absent".into(), escape],
        );
        assert_eq!(removed, 2);
        assert!(!work.path().join("logs").exists());
        assert!(outside.path().join("keep").exists());
    }

    #[tokio::test]
    async fn file_inclusion_is_copied() {
        let src = tempfile::tempdir().unwrap();
        let file = src.path().join("plugin.jar");
        fs::write(&file, "jar-bytes").unwrap();

        let work = tempfile::tempdir().unwrap();
        let inclusion = ServiceRemoteInclusion {
            url: format!("file://{}", file.display()),
            destination: "plugins/plugin.jar".into(),
        };
        fetch_inclusion(&inclusion, work.path()).await.unwrap();
        assert_eq!(fs::read_to_string(work.path().join("plugins/plugin.jar")).unwrap(), "jar-bytes");
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let work = tempfile::tempdir().unwrap();
        let inclusion = ServiceRemoteInclusion {
            url: "ftp://example.org/x".into(),
            destination: "x".into(),
        };
        let err = fetch_inclusion(&inclusion, work.path()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Inclusion { .. }));
    }

    #[tokio::test]
    async fn http_inclusion_is_downloaded() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhello")
                .await
                .unwrap();
        });

        let work = tempfile::tempdir().unwrap();
        let inclusion = ServiceRemoteInclusion {
            url: format!("http://{addr}/files/hello.txt"),
            destination: "hello.txt".into(),
        };
        fetch_inclusion(&inclusion, work.path()).await.unwrap();
        assert_eq!(fs::read_to_string(work.path().join("hello.txt")).unwrap(), "hello");
    }

    #[tokio::test]
    async fn http_error_status_fails_the_inclusion() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let work = tempfile::tempdir().unwrap();
        let inclusion = ServiceRemoteInclusion {
            url: format!("http://{addr}/missing.jar"),
            destination: "missing.jar".into(),
        };
        let err = fetch_inclusion(&inclusion, work.path()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Inclusion { ref reason, .. } if reason.contains("404")), "{err}");
        assert!(!work.path().join("missing.jar").exists());
    }
}
