//! Tokio plumbing for the two listeners. Each accepted connection gets a
//! reader that feeds decoded frames into the state machine under the master
//! lock, and a writer that drains the session's outbound channel. All
//! protocol state lives in the master; the tasks here only move bytes.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::Result;
use crate::master::Master;
use crate::matocs::Outbox;
use crate::proto::framing::{Frame, FrameDecoder};
use crate::proto::{ANTOMA_MAX_PACKET_SIZE, CSTOMA_MAX_PACKET_SIZE};
use crate::{matocs, matoml, SessId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Cs,
    Ml,
}

pub async fn spawn_listeners(master: Arc<Mutex<Master>>) -> Result<()> {
    let (cs_addr, ml_addr) = {
        let m = master.lock();
        (m.cfg.matocs_listen.clone(), m.cfg.matoml_listen.clone())
    };
    let cs_listener = TcpListener::bind(&cs_addr).await?;
    info!("master <-> chunkservers module: listen on {}", cs_addr);
    let ml_listener = TcpListener::bind(&ml_addr).await?;
    info!("master <-> metaloggers module: listen on {}", ml_addr);
    tokio::spawn(accept_loop(master.clone(), cs_listener, Kind::Cs));
    tokio::spawn(accept_loop(master, ml_listener, Kind::Ml));
    Ok(())
}

async fn accept_loop(master: Arc<Mutex<Master>>, listener: TcpListener, kind: Kind) {
    loop {
        let (sock, peer) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                warn!("accept error: {}", e);
                continue;
            }
        };
        let _ = sock.set_nodelay(true);
        let peer_ip = match peer.ip() {
            IpAddr::V4(ip) => u32::from(ip),
            IpAddr::V6(_) => 0,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let sid = {
            let mut m = master.lock();
            match kind {
                Kind::Cs => matocs::accept(&mut m, peer_ip, Outbox::Net(tx)),
                Kind::Ml => matoml::accept(&mut m, peer_ip, Outbox::Net(tx)),
            }
        };
        tokio::spawn(session_io(master.clone(), sock, rx, sid, kind));
    }
}

fn session_alive(m: &Master, sid: SessId, kind: Kind) -> Option<u16> {
    match kind {
        Kind::Cs => m.cs.session(sid).filter(|s| !s.kill).map(|s| s.timeout),
        Kind::Ml => m.ml.session(sid).filter(|s| !s.kill).map(|s| s.timeout),
    }
}

async fn session_io(
    master: Arc<Mutex<Master>>,
    sock: TcpStream,
    mut rx: mpsc::UnboundedReceiver<bytes::Bytes>,
    sid: SessId,
    kind: Kind,
) {
    let (mut rd, mut wr) = sock.into_split();
    let writer = tokio::spawn(async move {
        // drains until the session is dropped and the channel closes, so
        // frames enqueued before a kill still go out
        while let Some(frame) = rx.recv().await {
            if wr.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = wr.shutdown().await;
    });

    let max = match kind {
        Kind::Cs => CSTOMA_MAX_PACKET_SIZE,
        Kind::Ml => ANTOMA_MAX_PACKET_SIZE,
    };
    let mut dec = FrameDecoder::new(max);
    let mut buf = vec![0u8; 65536];
    let mut frames: Vec<Frame> = Vec::new();

    loop {
        let Some(timeout) = session_alive(&master.lock(), sid, kind) else {
            break;
        };
        let n = match tokio::time::timeout(
            Duration::from_secs(timeout.max(1) as u64),
            rd.read(&mut buf),
        )
        .await
        {
            Err(_elapsed) => {
                // idle past the session timeout
                break;
            }
            Ok(Err(_)) | Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
        };
        frames.clear();
        let ok = dec.feed(&buf[..n], &mut frames);
        {
            let mut m = master.lock();
            for f in frames.drain(..) {
                match kind {
                    Kind::Cs => matocs::handle_frame(&mut m, sid, f.ptype, &f.data),
                    Kind::Ml => matoml::handle_frame(&mut m, sid, f.ptype, &f.data),
                }
            }
        }
        if !ok {
            warn!("packet too long from peer - dropping connection");
            break;
        }
    }

    {
        let mut m = master.lock();
        match kind {
            Kind::Cs => matocs::session_closed(&mut m, sid),
            Kind::Ml => matoml::session_closed(&mut m, sid),
        }
    }
    // the session owned the tx; after removal the writer sees the channel
    // close and flushes out
    let _ = writer.await;
}
