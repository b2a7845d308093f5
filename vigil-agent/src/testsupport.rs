//! Minimal MQTT endpoint for lifecycle tests: accepts TCP connections,
//! acknowledges the CONNECT packet, swallows everything else, and counts
//! how many connections were opened and how many were alive at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

// CONNACK, session-present 0, return code 0 (accepted).
const CONNACK_OK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

pub struct FakeBroker {
    pub addr: std::net::SocketAddr,
    accepted: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl FakeBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let counters = (accepted.clone(), active.clone(), max_active.clone());
        tokio::spawn(async move {
            let (accepted, active, max_active) = counters;
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now_active, Ordering::SeqCst);

                let active = active.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    if socket.read(&mut buf).await.unwrap_or(0) > 0 {
                        let _ = socket.write_all(&CONNACK_OK).await;
                    }
                    while socket.read(&mut buf).await.unwrap_or(0) > 0 {}
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            addr,
            accepted,
            max_active,
        }
    }

    /// Connections opened since start.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open connections observed.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}
