//! The client session.
//!
//! After the connect phase (two-party exchange, then the first group rekey)
//! the session splits into two tasks sharing one socket:
//!
//! - the **sender** blocks on stdin, interprets commands, and seals outbound
//!   records with the current session key,
//! - the **receiver** blocks on the socket, answers rekey rounds inline, and
//!   prints decrypted user records.
//!
//! The write half and the session key live behind one mutex (the receiver
//! writes rekey replies and swaps the key, the sender writes chat), and an
//! atomic `keep_alive` flag plus a socket shutdown unwind both tasks
//! cooperatively. No task is ever forcibly killed.

use std::io::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::commands::{self, Command, Input, UserError, FILE_MAX};
use crate::crypto::{self, SecretKey, KEY_LEN};
use crate::kex::{self, KexError, RekeyStep};
use crate::wire::{self, WireError};

/// Longest accepted display name.
pub const USERNAME_MAX_LENGTH: usize = 32;
/// Longest accepted server address.
pub const ADDRESS_MAX_LENGTH: usize = 256;

/// Connection parameters for a session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Daemon host name or address.
    pub address: String,
    /// Daemon port.
    pub port: u16,
    /// Display name carried inside the ciphertext.
    pub username: String,
}

/// State shared between the sender and receiver tasks.
struct Shared {
    writer: OwnedWriteHalf,
    session_key: SecretKey,
}

/// An established session, ready to run.
pub struct Session {
    reader: OwnedReadHalf,
    shared: Arc<Mutex<Shared>>,
    ctrl_key: SecretKey,
    fingerprint: [u8; KEY_LEN],
    username: String,
    keep_alive: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

/// Connect to the daemon: TCP, two-party exchange, then service control
/// envelopes until the first session key lands.
pub async fn connect(config: ClientConfig) -> Result<Session> {
    let mut stream = TcpStream::connect((config.address.as_str(), config.port))
        .await
        .with_context(|| format!("connecting to {}:{}", config.address, config.port))?;

    let (ctrl_key, public) = kex::two_party_client(&mut stream)
        .await
        .context("key exchange failed (daemon full or unreachable?)")?;
    let fingerprint = crypto::fingerprint(&public);

    let mut rekey = None;
    let session_key = loop {
        let frame = wire::recv_frame(&mut stream)
            .await
            .context("waiting for the group key exchange")?;
        match kex::open_envelope(&ctrl_key, &frame) {
            Ok(envelope) => match kex::respond(&mut rekey, &ctrl_key, envelope)
                .context("group key exchange")?
            {
                RekeyStep::Reply(reply) => wire::send_all(&mut stream, &reply)
                    .await
                    .context("answering a rekey round")?,
                RekeyStep::Key(key) => break key,
                RekeyStep::Ignored => {}
            },
            // Records sealed before we joined; nothing to read them with yet.
            Err(KexError::Wire(WireError::AuthFailure)) => {
                debug!("dropping record from before the first rekey")
            }
            Err(e) => return Err(e).context("group key exchange"),
        }
    };

    let (reader, writer) = stream.into_split();
    Ok(Session {
        reader,
        shared: Arc::new(Mutex::new(Shared {
            writer,
            session_key,
        })),
        ctrl_key,
        fingerprint,
        username: config.username,
        keep_alive: Arc::new(AtomicBool::new(true)),
        shutdown: Arc::new(Notify::new()),
    })
}

impl Session {
    /// The session's identity fingerprint.
    pub fn fingerprint(&self) -> &[u8; KEY_LEN] {
        &self.fingerprint
    }

    /// Run the sender and receiver tasks until the user quits or the
    /// connection goes away.
    pub async fn run(self) -> Result<()> {
        let Session {
            reader,
            shared,
            ctrl_key,
            fingerprint,
            username,
            keep_alive,
            shutdown,
        } = self;

        let receiver = tokio::spawn(recv_loop(
            reader,
            Arc::clone(&shared),
            ctrl_key,
            Arc::clone(&keep_alive),
            Arc::clone(&shutdown),
        ));

        let sent = send_loop(&shared, username, fingerprint, &keep_alive, &shutdown).await;
        let received = receiver.await.context("receiver task panicked")?;
        sent.and(received)
    }
}

/// Seal a payload with the current session key and write one record.
async fn send_payload(shared: &Mutex<Shared>, payload: &[u8]) -> Result<(), WireError> {
    let mut guard = shared.lock().await;
    let frame = wire::seal(&guard.session_key, payload)?;
    wire::send_all(&mut guard.writer, &frame).await
}

async fn send_notice(shared: &Mutex<Shared>, notice: &str) -> Result<(), WireError> {
    send_payload(shared, format!("\x1b[33m{notice}\x1b[0m").as_bytes()).await
}

/// The sender task: stdin → commands → sealed records.
async fn send_loop(
    shared: &Mutex<Shared>,
    mut username: String,
    fingerprint: [u8; KEY_LEN],
    keep_alive: &AtomicBool,
    shutdown: &Notify,
) -> Result<()> {
    if let Err(e) = send_notice(shared, &format!("{username} has connected")).await {
        warn!(error = %e, "could not announce the connection");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while keep_alive.load(Ordering::Relaxed) {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => None,
            _ = shutdown.notified() => break,
            line = lines.next_line() => line.context("reading stdin")?,
        };

        // Ctrl-C and stdin EOF both mean a clean exit.
        let Some(line) = line else {
            let _ = send_notice(shared, &format!("{username} has disconnected")).await;
            break;
        };

        let outcome = match commands::parse(&line) {
            Ok(Input::Empty) => Ok(()),
            Ok(Input::Chat(text)) => {
                send_payload(shared, format!("{username}: {text}").as_bytes()).await
            }
            Ok(Input::Command(Command::Quit)) => {
                let _ = send_notice(shared, &format!("{username} has disconnected")).await;
                break;
            }
            Ok(Input::Command(Command::Fingerprint)) => {
                println!(
                    "Fingerprint is: {}",
                    crypto::fingerprint_display(&fingerprint)
                );
                Ok(())
            }
            Ok(Input::Command(Command::Username)) => {
                match prompt_username(&mut lines).await? {
                    Some(new_name) => {
                        let result = send_notice(
                            shared,
                            &format!("{username} has changed their username to {new_name}"),
                        )
                        .await;
                        username = new_name;
                        result
                    }
                    None => break,
                }
            }
            Ok(Input::Command(Command::File)) => send_file(shared, &mut lines).await,
            Err(e) => {
                println!("{e}");
                Ok(())
            }
        };

        if let Err(e) = outcome {
            warn!(error = %e, "send failed, closing the session");
            break;
        }
    }

    keep_alive.store(false, Ordering::Relaxed);
    // Closing our half makes the daemon reap the slot, which in turn
    // unblocks the receiver's pending read.
    let mut guard = shared.lock().await;
    let _ = guard.writer.shutdown().await;
    Ok(())
}

/// Prompt for a new username until it fits; `None` means stdin closed.
async fn prompt_username(lines: &mut Lines<BufReader<Stdin>>) -> Result<Option<String>> {
    loop {
        print!("> New username: ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next_line().await.context("reading stdin")? else {
            return Ok(None);
        };
        let name = line.trim();
        if name.is_empty() {
            continue;
        }
        if name.chars().count() > USERNAME_MAX_LENGTH {
            println!("> Maximum username length is {USERNAME_MAX_LENGTH} characters");
            continue;
        }
        return Ok(Some(name.to_string()));
    }
}

/// Prompt for a path and send the file as a single record.
///
/// Oversize and unreadable files produce a diagnostic and nothing else;
/// no record hits the wire.
async fn send_file(
    shared: &Mutex<Shared>,
    lines: &mut Lines<BufReader<Stdin>>,
) -> Result<(), WireError> {
    print!("> File path: ");
    std::io::stdout().flush().ok();
    let path = match lines.next_line().await {
        Ok(Some(line)) => line.trim().to_string(),
        Ok(None) | Err(_) => return Ok(()),
    };
    if path.is_empty() {
        return Ok(());
    }

    let basename = Path::new(&path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(metadata) => metadata,
        Err(_) => {
            println!("File {path:?} not found");
            return Ok(());
        }
    };
    if metadata.len() == 0 {
        println!("File {path:?} is empty, nothing to send");
        return Ok(());
    }
    if metadata.len() > FILE_MAX as u64 {
        println!(
            "{}",
            UserError::OversizeFile {
                name: basename,
                over: metadata.len() - FILE_MAX as u64,
                max: FILE_MAX,
            }
        );
        return Ok(());
    }

    let contents = match tokio::fs::read(&path).await {
        Ok(contents) => contents,
        Err(e) => {
            println!("Could not read file {path:?}: {e}");
            return Ok(());
        }
    };
    match commands::pack_file(&basename, &contents) {
        Ok(payload) => {
            send_payload(shared, &payload).await?;
            println!("Sent {basename:?} ({} bytes)", contents.len());
        }
        Err(e) => println!("{e}"),
    }
    Ok(())
}

/// The receiver task: records → rekey answers or rendered messages.
async fn recv_loop(
    mut reader: OwnedReadHalf,
    shared: Arc<Mutex<Shared>>,
    ctrl_key: SecretKey,
    keep_alive: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let mut rekey = None;
    while keep_alive.load(Ordering::Relaxed) {
        let frame = match wire::recv_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(WireError::Closed) => {
                if keep_alive.load(Ordering::Relaxed) {
                    println!("Disconnected from daemon");
                }
                break;
            }
            Err(e) => {
                if keep_alive.load(Ordering::Relaxed) {
                    warn!(error = %e, "connection lost");
                }
                break;
            }
        };

        match kex::open_envelope(&ctrl_key, &frame) {
            Ok(envelope) => match kex::respond(&mut rekey, &ctrl_key, envelope) {
                Ok(RekeyStep::Reply(reply)) => {
                    let mut guard = shared.lock().await;
                    if let Err(e) = wire::send_all(&mut guard.writer, &reply).await {
                        warn!(error = %e, "could not answer a rekey round");
                        break;
                    }
                }
                Ok(RekeyStep::Key(key)) => {
                    shared.lock().await.session_key = key;
                    debug!("session key rotated");
                }
                Ok(RekeyStep::Ignored) => {}
                Err(e) => {
                    warn!(error = %e, "group key exchange failed");
                    break;
                }
            },
            Err(KexError::Wire(WireError::AuthFailure)) => {
                let guard = shared.lock().await;
                match wire::open(&guard.session_key, &frame) {
                    Ok(payload) => {
                        drop(guard);
                        render(&payload).await;
                    }
                    // Sealed under a key we no longer (or don't yet) hold.
                    Err(_) => warn!("dropping record that failed authentication"),
                }
            }
            Err(e) => warn!(error = %e, "dropping malformed control envelope"),
        }
    }

    keep_alive.store(false, Ordering::Relaxed);
    shutdown.notify_waiters();
    Ok(())
}

/// Print a chat line, or save a payload that looks like a file transfer.
async fn render(payload: &[u8]) {
    if let Some((name, contents)) = commands::unpack_file(payload) {
        match tokio::fs::write(&name, contents).await {
            Ok(()) => println!("Received file {name:?} ({} bytes)", contents.len()),
            Err(e) => warn!(file = %name, error = %e, "could not save received file"),
        }
    } else {
        println!("{}", String::from_utf8_lossy(payload));
    }
}
