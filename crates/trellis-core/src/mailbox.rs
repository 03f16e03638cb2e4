//! Per-peer command mailboxes.
//!
//! A mailbox is a bounded FIFO of decoded frames for one (peer, command-tag)
//! pair. Control commands are strict request/reply, so mailboxes are opened
//! with depth 1 and an overflow is a protocol violation (a second
//! unsolicited reply) that drains the offending link. The file-transfer tags
//! stream FileData frames over the command channel and open a deeper window
//! instead; for those the dispatcher awaits capacity, extending session
//! back-pressure to file streams.
//!
//! A mailbox exists only while a consumer awaits it. The dispatcher treats a
//! frame with no open mailbox as an inbound request for the role's command
//! handlers, which is how both ends of the rendezvous share one tag.

use crate::error::{Error, Result};
use crate::wire::{CmdTag, Frame};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

/// One open command mailbox.
pub struct CommandMailbox {
    tx: mpsc::Sender<Frame>,
    rx: Mutex<mpsc::Receiver<Frame>>,
    blocking: bool,
}

impl CommandMailbox {
    fn new(depth: usize, blocking: bool) -> Self {
        let (tx, rx) = mpsc::channel(depth);
        Self {
            tx,
            rx: Mutex::new(rx),
            blocking,
        }
    }

    /// Await the next frame.
    pub async fn recv(&self) -> Option<Frame> {
        self.rx.lock().await.recv().await
    }

    /// Non-blocking drain of one frame, used after the owning peer died to
    /// pick up a reply that raced the shutdown.
    pub fn try_recv(&self) -> Option<Frame> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

/// The command mailboxes of one peer, keyed by tag.
pub struct Mailboxes {
    open: DashMap<CmdTag, Arc<CommandMailbox>>,
}

impl Mailboxes {
    /// Create an empty mailbox table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            open: DashMap::new(),
        }
    }

    /// Open a mailbox for `tag`.
    ///
    /// # Errors
    ///
    /// Returns a protocol error when a mailbox for the tag is already open:
    /// concurrent issuance on one (peer, command-type) is forbidden by
    /// contract.
    pub fn open(&self, tag: CmdTag, depth: usize, blocking: bool) -> Result<Arc<CommandMailbox>> {
        let mailbox = Arc::new(CommandMailbox::new(depth, blocking));
        match self.open.entry(tag) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Protocol(format!(
                "concurrent command on tag {tag:?}"
            ))),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(mailbox.clone());
                Ok(mailbox)
            }
        }
    }

    /// Close the mailbox for `tag`.
    pub fn close(&self, tag: CmdTag) {
        self.open.remove(&tag);
    }

    /// Deliver a frame into the open mailbox for its tag.
    ///
    /// Returns `Ok(false)` when no mailbox is open (the frame is an inbound
    /// request, not an awaited reply).
    ///
    /// # Errors
    ///
    /// Returns a protocol error when a depth-1 mailbox is already full.
    pub async fn deliver(&self, tag: CmdTag, frame: Frame) -> Result<bool> {
        let Some(mailbox) = self.open.get(&tag).map(|e| e.value().clone()) else {
            return Ok(false);
        };

        if mailbox.blocking {
            mailbox
                .tx
                .send(frame)
                .await
                .map_err(|_| Error::Protocol("command window receiver vanished".into()))?;
        } else {
            mailbox.tx.try_send(frame).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    Error::Protocol(format!("unsolicited extra reply on tag {tag:?}"))
                }
                mpsc::error::TrySendError::Closed(_) => {
                    Error::Protocol("command mailbox receiver vanished".into())
                }
            })?;
        }
        Ok(true)
    }
}

impl Default for Mailboxes {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;
    use crate::wire::FrameHeader;

    fn frame(tag: CmdTag) -> Frame {
        Frame {
            header: FrameHeader {
                src: NodeId::from_bytes([1u8; 32]),
                dst: NodeId::from_bytes([2u8; 32]),
                tag,
            },
            body: vec![],
        }
    }

    #[tokio::test]
    async fn test_deliver_without_listener() {
        let boxes = Mailboxes::new();
        let delivered = boxes.deliver(CmdTag::Listen, frame(CmdTag::Listen)).await;
        assert!(matches!(delivered, Ok(false)));
    }

    #[tokio::test]
    async fn test_request_reply_rendezvous() {
        let boxes = Mailboxes::new();
        let mailbox = boxes.open(CmdTag::Listen, 1, false).unwrap();

        assert!(
            boxes
                .deliver(CmdTag::Listen, frame(CmdTag::Listen))
                .await
                .unwrap()
        );
        let got = mailbox.recv().await.unwrap();
        assert_eq!(got.header.tag, CmdTag::Listen);
    }

    #[tokio::test]
    async fn test_second_reply_is_protocol_violation() {
        let boxes = Mailboxes::new();
        let _mailbox = boxes.open(CmdTag::Listen, 1, false).unwrap();

        boxes
            .deliver(CmdTag::Listen, frame(CmdTag::Listen))
            .await
            .unwrap();
        let second = boxes.deliver(CmdTag::Listen, frame(CmdTag::Listen)).await;
        assert!(matches!(second, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_concurrent_open_rejected() {
        let boxes = Mailboxes::new();
        let _first = boxes.open(CmdTag::Sync, 1, false).unwrap();
        assert!(matches!(
            boxes.open(CmdTag::Sync, 1, false),
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_close_reopens_tag() {
        let boxes = Mailboxes::new();
        let _first = boxes.open(CmdTag::Sync, 1, false).unwrap();
        boxes.close(CmdTag::Sync);
        assert!(boxes.open(CmdTag::Sync, 1, false).is_ok());
    }

    #[tokio::test]
    async fn test_window_mailbox_accepts_burst() {
        let boxes = Mailboxes::new();
        let mailbox = boxes.open(CmdTag::Download, 8, true).unwrap();

        for _ in 0..8 {
            assert!(
                boxes
                    .deliver(CmdTag::Download, frame(CmdTag::Download))
                    .await
                    .unwrap()
            );
        }
        for _ in 0..8 {
            assert!(mailbox.recv().await.is_some());
        }
    }
}
