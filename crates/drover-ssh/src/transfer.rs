use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;

use drover_core::error::{Error, Result};

use crate::client::{Client, lock_session};

impl Client {
    /// Create `path` and any missing parents over SFTP, then chmod the
    /// target to `mode`. Provider errors are returned verbatim.
    pub async fn mkdir_all(&self, path: &str, mode: u32) -> Result<()> {
        let session = self.session();
        let path = path.to_string();
        run_blocking(move || {
            let sess = lock_session(&session);
            let sftp = sess.sftp().context("open sftp")?;
            mkdir_all_blocking(&sftp, Path::new(&path), mode)
        })
        .await
    }

    /// Create or truncate `path` over SFTP, write `data` in full, and
    /// chmod to `mode`. Partial writes surface as errors.
    pub async fn upload(&self, path: &str, data: Vec<u8>, mode: u32) -> Result<()> {
        let session = self.session();
        let path = path.to_string();
        run_blocking(move || {
            let sess = lock_session(&session);
            let sftp = sess.sftp().context("open sftp")?;
            let flags =
                ssh2::OpenFlags::WRITE | ssh2::OpenFlags::CREATE | ssh2::OpenFlags::TRUNCATE;
            let mut file = sftp
                .open_mode(Path::new(&path), flags, mode as i32, ssh2::OpenType::File)
                .with_context(|| format!("create {path}"))?;
            file.write_all(&data).with_context(|| format!("write {path}"))?;
            sftp.setstat(Path::new(&path), perm_only(mode))
                .with_context(|| format!("chmod {path}"))?;
            Ok(())
        })
        .await
    }
}

async fn run_blocking<F>(f: F) -> Result<()>
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(Error::Transport(err)),
        Err(err) => Err(Error::Transport(err.into())),
    }
}

fn perm_only(mode: u32) -> ssh2::FileStat {
    ssh2::FileStat {
        size: None,
        uid: None,
        gid: None,
        perm: Some(mode),
        atime: None,
        mtime: None,
    }
}

fn mkdir_all_blocking(sftp: &ssh2::Sftp, path: &Path, mode: u32) -> anyhow::Result<()> {
    for partial in ancestor_chain(path) {
        if sftp.stat(&partial).is_ok() {
            continue;
        }
        // A racing creator between stat and mkdir is fine; anything
        // else is not.
        if let Err(err) = sftp.mkdir(&partial, mode as i32)
            && sftp.stat(&partial).is_err()
        {
            return Err(anyhow::Error::new(err)
                .context(format!("mkdir {}", partial.display())));
        }
    }
    sftp.setstat(path, perm_only(mode))
        .with_context(|| format!("chmod {}", path.display()))?;
    Ok(())
}

/// Every prefix of `path` that names a real directory, shallowest
/// first. The bare filesystem root is excluded.
fn ancestor_chain(path: &Path) -> Vec<PathBuf> {
    let mut chain = Vec::new();
    let mut partial = PathBuf::new();
    for component in path.components() {
        partial.push(component);
        if partial.parent().is_some() {
            chain.push(partial.clone());
        }
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancestor_chain_absolute() {
        let chain = ancestor_chain(Path::new("/tmp/drover/workspace"));
        assert_eq!(
            chain,
            vec![
                PathBuf::from("/tmp"),
                PathBuf::from("/tmp/drover"),
                PathBuf::from("/tmp/drover/workspace"),
            ]
        );
    }

    #[test]
    fn test_ancestor_chain_relative() {
        let chain = ancestor_chain(Path::new("work/scripts"));
        assert_eq!(
            chain,
            vec![PathBuf::from("work"), PathBuf::from("work/scripts")]
        );
    }

    #[test]
    fn test_ancestor_chain_root_only() {
        assert!(ancestor_chain(Path::new("/")).is_empty());
    }

    #[test]
    fn test_perm_only_sets_nothing_else() {
        let stat = perm_only(0o777);
        assert_eq!(stat.perm, Some(0o777));
        assert!(stat.size.is_none());
        assert!(stat.uid.is_none());
        assert!(stat.mtime.is_none());
    }
}
