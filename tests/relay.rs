//! End-to-end tests for the relay daemon.
//!
//! These drive a real daemon over real sockets with scripted protocol peers:
//! each peer runs the genuine two-party exchange and answers genuine rekey
//! rounds, so the scenarios exercise the same code paths the client does,
//! minus stdin.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio::time::timeout;

use parcel::crypto::KEY_LEN;
use parcel::daemon::{Daemon, DaemonConfig};
use parcel::kex::{self, KexError, Rekey, RekeyStep};
use parcel::wire::{self, WireError, HEADER_LEN, IV_LEN, TAG_LEN};
use parcel::SecretKey;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Spawn a daemon on an ephemeral port and return its connect address.
async fn start_daemon(max_connections: usize) -> Result<SocketAddr> {
    let mut daemon = Daemon::bind(DaemonConfig {
        port: 0,
        backlog: 8,
        max_connections,
    })
    .await?;
    let port = daemon.local_addr()?.port();
    tokio::spawn(async move {
        let _ = daemon.run().await;
    });
    Ok(SocketAddr::from(([127, 0, 0, 1], port)))
}

enum Handled {
    Rotated,
    Chat(Vec<u8>),
    Nothing,
}

/// A scripted peer speaking the real protocol.
struct TestPeer {
    stream: TcpStream,
    ctrl_key: SecretKey,
    rekey: Option<Rekey>,
    session_key: Option<SecretKey>,
}

impl TestPeer {
    /// Connect, run the two-party exchange, and serve the join rekey.
    async fn join(addr: SocketAddr) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        let (ctrl_key, _public) = kex::two_party_client(&mut stream).await?;
        let mut peer = Self {
            stream,
            ctrl_key,
            rekey: None,
            session_key: None,
        };
        peer.pump_until_rekeyed().await?;
        Ok(peer)
    }

    async fn handle(&mut self, frame: Vec<u8>) -> Result<Handled> {
        match kex::open_envelope(&self.ctrl_key, &frame) {
            Ok(envelope) => match kex::respond(&mut self.rekey, &self.ctrl_key, envelope)? {
                RekeyStep::Reply(reply) => {
                    wire::send_all(&mut self.stream, &reply).await?;
                    Ok(Handled::Nothing)
                }
                RekeyStep::Key(key) => {
                    self.session_key = Some(key);
                    Ok(Handled::Rotated)
                }
                RekeyStep::Ignored => Ok(Handled::Nothing),
            },
            Err(KexError::Wire(WireError::AuthFailure)) => match &self.session_key {
                Some(key) => Ok(wire::open(key, &frame)
                    .map(Handled::Chat)
                    .unwrap_or(Handled::Nothing)),
                None => Ok(Handled::Nothing),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Serve rekey rounds until a fresh session key lands.
    async fn pump_until_rekeyed(&mut self) -> Result<()> {
        loop {
            let frame = wire::recv_frame(&mut self.stream).await?;
            if matches!(self.handle(frame).await?, Handled::Rotated) {
                return Ok(());
            }
        }
    }

    /// Receive frames until one decrypts as a user record.
    async fn recv_chat(&mut self) -> Result<String> {
        loop {
            let frame = wire::recv_frame(&mut self.stream).await?;
            if let Handled::Chat(payload) = self.handle(frame).await? {
                return Ok(String::from_utf8(payload)?);
            }
        }
    }

    async fn send_chat(&mut self, text: &str) -> Result<()> {
        let key = self.session_key.clone().expect("peer has no session key");
        let frame = wire::seal(&key, text.as_bytes())?;
        wire::send_all(&mut self.stream, &frame).await?;
        Ok(())
    }

    fn key(&self) -> [u8; KEY_LEN] {
        *self
            .session_key
            .as_ref()
            .expect("peer has no session key")
            .as_bytes()
    }
}

#[tokio::test]
async fn records_fan_out_and_joins_rotate_the_key() -> Result<()> {
    timeout(TEST_TIMEOUT, async {
        let addr = start_daemon(8).await?;

        let mut alice = TestPeer::join(addr).await?;
        let alice_solo_key = alice.key();

        let (bob, pumped) = tokio::join!(TestPeer::join(addr), alice.pump_until_rekeyed());
        let mut bob = bob?;
        pumped?;

        // Every member of the new group holds the same fresh key.
        assert_eq!(alice.key(), bob.key());
        assert_ne!(alice.key(), alice_solo_key);

        alice.send_chat("Alice: hi").await?;
        assert_eq!(bob.recv_chat().await?, "Alice: hi");

        bob.send_chat("Bob: hello").await?;
        assert_eq!(alice.recv_chat().await?, "Bob: hello");
        Ok(())
    })
    .await
    .expect("test timed out")
}

#[tokio::test]
async fn leaving_rotates_the_key_for_the_survivors() -> Result<()> {
    timeout(TEST_TIMEOUT, async {
        let addr = start_daemon(8).await?;

        let mut alice = TestPeer::join(addr).await?;
        let (bob, pumped) = tokio::join!(TestPeer::join(addr), alice.pump_until_rekeyed());
        let mut bob = bob?;
        pumped?;
        let (carol, a, b) = tokio::join!(
            TestPeer::join(addr),
            alice.pump_until_rekeyed(),
            bob.pump_until_rekeyed()
        );
        let carol = carol?;
        a?;
        b?;

        let key_with_carol = alice.key();
        assert_eq!(key_with_carol, carol.key());

        drop(carol);
        let (a, b) = tokio::join!(alice.pump_until_rekeyed(), bob.pump_until_rekeyed());
        a?;
        b?;

        assert_eq!(alice.key(), bob.key());
        assert_ne!(alice.key(), key_with_carol);

        alice.send_chat("Alice: test").await?;
        assert_eq!(bob.recv_chat().await?, "Alice: test");
        Ok(())
    })
    .await
    .expect("test timed out")
}

#[tokio::test]
async fn capacity_rejection_leaves_the_group_undisturbed() -> Result<()> {
    timeout(TEST_TIMEOUT, async {
        // Table of 3: the listener plus two peers.
        let addr = start_daemon(3).await?;

        let mut alice = TestPeer::join(addr).await?;
        let (bob, pumped) = tokio::join!(TestPeer::join(addr), alice.pump_until_rekeyed());
        let mut bob = bob?;
        pumped?;
        let full_key = alice.key();

        // The third connection is accepted then immediately closed, before
        // any key exchange.
        assert!(TestPeer::join(addr).await.is_err());

        // No rekey happened and the group still relays.
        assert_eq!(alice.key(), full_key);
        assert_eq!(bob.key(), full_key);
        alice.send_chat("Alice: still here").await?;
        assert_eq!(bob.recv_chat().await?, "Alice: still here");
        Ok(())
    })
    .await
    .expect("test timed out")
}

#[tokio::test]
async fn oversize_frame_reaps_only_the_offender() -> Result<()> {
    timeout(TEST_TIMEOUT, async {
        let addr = start_daemon(8).await?;

        let mut alice = TestPeer::join(addr).await?;
        let (bob, pumped) = tokio::join!(TestPeer::join(addr), alice.pump_until_rekeyed());
        let mut bob = bob?;
        pumped?;
        let (evil, a, b) = tokio::join!(
            TestPeer::join(addr),
            alice.pump_until_rekeyed(),
            bob.pump_until_rekeyed()
        );
        let mut evil = evil?;
        a?;
        b?;
        let key_before = alice.key();

        // A header announcing a 4 GiB payload.
        let mut header = [0u8; HEADER_LEN];
        header[IV_LEN + TAG_LEN..].copy_from_slice(&0xFFFF_FFFFu64.to_be_bytes());
        wire::send_all(&mut evil.stream, &header).await?;

        // The daemon drops the offender and rekeys the survivors.
        let (a, b) = tokio::join!(alice.pump_until_rekeyed(), bob.pump_until_rekeyed());
        a?;
        b?;
        assert_eq!(alice.key(), bob.key());
        assert_ne!(alice.key(), key_before);

        // The offender's socket is dead.
        assert!(wire::recv_frame(&mut evil.stream).await.is_err());

        alice.send_chat("Alice: unaffected").await?;
        assert_eq!(bob.recv_chat().await?, "Alice: unaffected");
        Ok(())
    })
    .await
    .expect("test timed out")
}

#[tokio::test]
async fn simultaneous_senders_each_deliver_exactly_once() -> Result<()> {
    timeout(TEST_TIMEOUT, async {
        let addr = start_daemon(8).await?;

        let mut alice = TestPeer::join(addr).await?;
        let (bob, pumped) = tokio::join!(TestPeer::join(addr), alice.pump_until_rekeyed());
        let mut bob = bob?;
        pumped?;

        let (a, b) = tokio::join!(alice.send_chat("from alice"), bob.send_chat("from bob"));
        a?;
        b?;

        assert_eq!(alice.recv_chat().await?, "from bob");
        assert_eq!(bob.recv_chat().await?, "from alice");

        // Follow-up markers arrive next, so neither record was duplicated.
        alice.send_chat("marker alice").await?;
        bob.send_chat("marker bob").await?;
        assert_eq!(alice.recv_chat().await?, "marker bob");
        assert_eq!(bob.recv_chat().await?, "marker alice");
        Ok(())
    })
    .await
    .expect("test timed out")
}

#[tokio::test]
async fn sender_order_is_preserved_end_to_end() -> Result<()> {
    timeout(TEST_TIMEOUT, async {
        let addr = start_daemon(8).await?;

        let mut alice = TestPeer::join(addr).await?;
        let (bob, pumped) = tokio::join!(TestPeer::join(addr), alice.pump_until_rekeyed());
        let mut bob = bob?;
        pumped?;

        for n in 0..20 {
            alice.send_chat(&format!("message {n}")).await?;
        }
        for n in 0..20 {
            assert_eq!(bob.recv_chat().await?, format!("message {n}"));
        }
        Ok(())
    })
    .await
    .expect("test timed out")
}
