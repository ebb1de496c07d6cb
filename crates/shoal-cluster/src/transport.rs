//! Framed TCP transport
//!
//! Each connection gets a reader task (decodes frames into controller
//! events) and a writer task (drains the link's frame queue).  The writer
//! exits when the controller drops the last [`PeerLink`] handle, which
//! closes the socket and in turn ends the reader with a `LinkClosed`.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use shoal_proto::ShoalCodec;

use crate::controller::Event;
use crate::link::PeerLink;
use crate::node::NodeId;

/// Wrap an established stream in reader/writer tasks and hand back the
/// link for the controller to own.
pub fn spawn_link(events: mpsc::UnboundedSender<Event>, stream: TcpStream) -> PeerLink {
    let _ = stream.set_nodelay(true);
    let (link, mut out_rx) = PeerLink::new();
    let link_id = link.id();
    let (read_half, write_half) = stream.into_split();

    let mut writer = FramedWrite::new(write_half, ShoalCodec);
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if writer.send(frame).await.is_err() {
                break;
            }
        }
        debug!(link = link_id, "writer finished");
    });

    let mut reader = FramedRead::new(read_half, ShoalCodec);
    tokio::spawn(async move {
        while let Some(next) = reader.next().await {
            match next {
                Ok(frame) => {
                    let header = frame.header;
                    let event = match frame.message() {
                        Ok(msg) => Event::Frame {
                            link_id,
                            header,
                            msg,
                        },
                        Err(e) => {
                            warn!(link = link_id, %e, "undecodable payload");
                            Event::BadFrame { link_id, header }
                        }
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(link = link_id, %e, "connection error");
                    break;
                }
            }
        }
        let _ = events.send(Event::LinkClosed { link_id });
    });

    link
}

/// Dial a peer with a connect timeout.  Delivers `Dialed` or `DialFailed`
/// to the controller; never blocks it.
pub fn spawn_dial(
    events: mpsc::UnboundedSender<Event>,
    node: NodeId,
    addr: String,
    timeout: Duration,
) {
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                let link = spawn_link(events.clone(), stream);
                let _ = events.send(Event::Dialed { node, link });
            }
            Ok(Err(e)) => {
                debug!(peer = %addr, %e, "connect failed");
                let _ = events.send(Event::DialFailed { node });
            }
            Err(_) => {
                debug!(peer = %addr, "connect timed out");
                let _ = events.send(Event::DialFailed { node });
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_proto::{Frame, Message};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_round_trip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let client_link = spawn_link(events_tx.clone(), client);
        let _server_link = spawn_link(events_tx.clone(), server);

        assert!(client_link.send(&Message::LoadLevels));

        // the server side surfaces the decoded frame
        loop {
            match events_rx.recv().await.unwrap() {
                Event::Frame { msg, header, .. } => {
                    assert_eq!(msg, Message::LoadLevels);
                    assert!(!header.is_reply());
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_dropping_link_closes_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let client_link = spawn_link(events_tx.clone(), client);
        let server_link = spawn_link(events_tx.clone(), server);
        let server_id = server_link.id();

        // dropping the client's only handle shuts the connection down
        drop(client_link);

        loop {
            match events_rx.recv().await.unwrap() {
                Event::LinkClosed { link_id } if link_id == server_id => break,
                _ => continue,
            }
        }
        let _ = server_link;
    }

    #[tokio::test]
    async fn test_dial_failure_reports() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        // a port nothing listens on
        spawn_dial(
            events_tx,
            3,
            "127.0.0.1:1".to_string(),
            Duration::from_secs(2),
        );
        match events_rx.recv().await.unwrap() {
            Event::DialFailed { node } => assert_eq!(node, 3),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_frame_surfaces() {
        use tokio::io::AsyncWriteExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let _server_link = spawn_link(events_tx, server);

        // a header with an unknown command and an empty payload
        let frame = Frame {
            header: shoal_proto::Header {
                command: 0x7abc,
                reply_cmd: 0,
                request_id: 1,
                payload_len: 0,
            },
            payload: bytes::Bytes::new(),
        };
        let mut buf = bytes::BytesMut::new();
        frame.header.write_to(&mut buf);
        client.write_all(&buf).await.unwrap();

        loop {
            match events_rx.recv().await.unwrap() {
                Event::BadFrame { header, .. } => {
                    assert_eq!(header.command, 0x7abc);
                    break;
                }
                _ => continue,
            }
        }
    }
}
