use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use drover_core::error::{Error, Result};

const SSH_PORT: u16 = 22;
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between non-blocking channel polls while a command runs.
const READ_IDLE: Duration = Duration::from_millis(25);
const CHUNK: usize = 8192;

/// Authenticated SSH session to one VM.
///
/// libssh2 sessions are not thread-safe, so every operation takes the
/// session mutex and runs on the blocking pool. Host keys are accepted
/// on first use: pool VMs are freshly created and generate their keys
/// at boot, so there is nothing to pin against.
pub struct Client {
    session: Arc<StdMutex<ssh2::Session>>,
    addr: String,
}

impl Client {
    /// Open a TCP connection, complete the SSH handshake, and
    /// authenticate `user` with an in-memory private key.
    pub async fn dial(
        cancel: &CancellationToken,
        ip: &str,
        user: &str,
        private_key: &str,
    ) -> Result<Client> {
        let addr = format!("{ip}:{SSH_PORT}");
        let target = addr.clone();
        let user = user.to_string();
        let key = private_key.to_string();

        let handle = tokio::task::spawn_blocking(move || dial_blocking(&target, &user, &key));
        let session = tokio::select! {
            joined = handle => joined
                .map_err(|e| Error::Transport(e.into()))?
                .map_err(Error::Transport)?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        debug!(addr = %addr, "ssh session established");
        Ok(Client {
            session: Arc::new(StdMutex::new(session)),
            addr,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub(crate) fn session(&self) -> Arc<StdMutex<ssh2::Session>> {
        Arc::clone(&self.session)
    }

    /// Run `command` on the VM, streaming interleaved stdout and stderr
    /// into `sink`, and return the remote exit code.
    ///
    /// On cancellation the channel is closed best-effort and
    /// `Error::Cancelled` is returned. The SSH wire protocol cannot
    /// reliably signal remote processes, so the command may keep
    /// running on the VM; callers must not assume graceful teardown.
    pub async fn exec(
        &self,
        cancel: &CancellationToken,
        command: &str,
        sink: &mut (dyn Write + Send),
    ) -> Result<i32> {
        let session = self.session();
        let command = command.to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(32);

        let mut task =
            tokio::task::spawn_blocking(move || exec_blocking(&session, &command, tx, &stop_flag));

        loop {
            tokio::select! {
                chunk = rx.recv() => match chunk {
                    Some(bytes) => sink
                        .write_all(&bytes)
                        .map_err(|e| Error::Transport(e.into()))?,
                    None => break,
                },
                _ = cancel.cancelled() => {
                    stop.store(true, Ordering::Relaxed);
                    // Unblock a sender stuck on a full channel, then wait
                    // for the blocking task to wind down.
                    rx.close();
                    let _ = (&mut task).await;
                    debug!(addr = %self.addr, "exec cancelled");
                    return Err(Error::Cancelled);
                }
            }
        }

        match task.await {
            Ok(Ok(code)) => {
                debug!(addr = %self.addr, exit = code, "remote command finished");
                Ok(code)
            }
            Ok(Err(err)) => Err(Error::Transport(err)),
            Err(err) => Err(Error::Transport(err.into())),
        }
    }
}

pub(crate) fn lock_session(
    session: &StdMutex<ssh2::Session>,
) -> MutexGuard<'_, ssh2::Session> {
    session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn dial_blocking(addr: &str, user: &str, private_key: &str) -> anyhow::Result<ssh2::Session> {
    let target = addr
        .to_socket_addrs()
        .with_context(|| format!("resolve {addr}"))?
        .next()
        .ok_or_else(|| anyhow!("no address for {addr}"))?;
    let tcp =
        TcpStream::connect_timeout(&target, DIAL_TIMEOUT).with_context(|| format!("connect to {addr}"))?;

    let mut session = ssh2::Session::new().context("create ssh session")?;
    session.set_tcp_stream(tcp);
    session.handshake().context("ssh handshake")?;
    session
        .userauth_pubkey_memory(user, None, private_key, None)
        .with_context(|| format!("key auth for user {user}"))?;
    if !session.authenticated() {
        bail!("authentication rejected for user {user}");
    }
    Ok(session)
}

fn exec_blocking(
    session: &StdMutex<ssh2::Session>,
    command: &str,
    tx: mpsc::Sender<Vec<u8>>,
    stop: &AtomicBool,
) -> anyhow::Result<i32> {
    let sess = lock_session(session);
    let mut channel = sess.channel_session().context("open channel")?;
    channel.exec(command).context("exec request")?;

    // Non-blocking reads let the loop notice cancellation between polls.
    sess.set_blocking(false);
    let mut buf = [0u8; CHUNK];
    let mut out_done = false;
    let mut err_done = false;
    while !(out_done && err_done) {
        if stop.load(Ordering::Relaxed) {
            sess.set_blocking(true);
            let _ = channel.close();
            bail!("cancelled before the command finished");
        }
        let mut progressed = false;
        if !out_done {
            match channel.read(&mut buf) {
                Ok(0) => out_done = true,
                Ok(n) => {
                    progressed = true;
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        sess.set_blocking(true);
                        let _ = channel.close();
                        bail!("output sink went away");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    sess.set_blocking(true);
                    return Err(anyhow!(e).context("read remote stdout"));
                }
            }
        }
        if !err_done {
            match channel.stderr().read(&mut buf) {
                Ok(0) => err_done = true,
                Ok(n) => {
                    progressed = true;
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        sess.set_blocking(true);
                        let _ = channel.close();
                        bail!("output sink went away");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    sess.set_blocking(true);
                    return Err(anyhow!(e).context("read remote stderr"));
                }
            }
        }
        if !progressed {
            std::thread::sleep(READ_IDLE);
        }
    }
    drop(tx);

    sess.set_blocking(true);
    channel.wait_close().context("close channel")?;
    channel.exit_status().context("exit status")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_rejects_non_ssh_peer() {
        // A listener that accepts and immediately hangs up is not an
        // SSH server; the handshake must fail, not hang.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        // Client::dial always targets port 22, so exercise the blocking
        // path directly against the ephemeral port.
        let addr = format!("127.0.0.1:{port}");
        let result =
            tokio::task::spawn_blocking(move || dial_blocking(&addr, "root", "not a key"))
                .await
                .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dial_surfaces_transport_error() {
        let cancel = CancellationToken::new();
        // Either nothing listens on 22 (refused) or an sshd rejects the
        // bogus key; both must surface as a transport error.
        let result = Client::dial(&cancel, "127.0.0.1", "root", "not a key").await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn test_dial_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = Client::dial(&cancel, "203.0.113.1", "root", "key").await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
