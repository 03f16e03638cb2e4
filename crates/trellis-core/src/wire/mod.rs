//! Frame codec for the overlay wire protocol.
//!
//! One frame is a fixed-shape header followed by a typed body:
//!
//! ```text
//! separator[4]     constant magic, plaintext
//! nonce[24]        fresh AEAD nonce, plaintext
//! ct_len: u32      ciphertext length, plaintext
//! ct[ct_len]       sealed envelope, AAD = separator
//!   inner_len: u32 length of src + dst + tag + body
//!   src[32]        identity of originator
//!   dst[32]        identity of ultimate recipient
//!   tag: u16       command tag selecting the body shape
//!   body[..]
//!   padding        random bytes to the next size class
//! ```
//!
//! All multi-byte integers are big-endian on both sides. The separator is a
//! resynchronization anchor for diagnostics; it is not scanned for
//! mid-stream, so a framing error is fatal for the link. Relays open a frame
//! to read its destination and seal it afresh toward the next hop, which
//! also re-randomizes nonce and padding per link.

pub mod body;

pub use body::{
    AckBody, ConnectReq, DataBody, DownloadRep, DownloadReq, FileDataBody, HelloBody, IdentBody,
    LForwardBody, ListenReq, ProbeBody, RForwardReq, Reader, ShellReq, SocksReq, SshConnectReq,
    SyncBody, UploadReq, WireBody, Writer,
};

use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::{MAX_FRAME_SIZE, NODE_ID_SIZE, PROTOCOL_SEPARATOR};
use trellis_crypto::{FrameSealer, NONCE_SIZE, padding};

/// Size of the encoded command tag
pub const TAG_SIZE: usize = 2;

/// Fixed inner header size: src + dst + tag
pub const INNER_HEADER_SIZE: usize = 2 * NODE_ID_SIZE + TAG_SIZE;

/// Command tags as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CmdTag {
    /// Admission probe / identity exchange
    Init = 1,
    /// Topology synchronization
    Sync = 2,
    /// Open a listener on the remote node
    Listen = 3,
    /// Dial out from the remote node
    Connect = 4,
    /// Push a file to the remote node
    Upload = 5,
    /// Pull a file from the remote node
    Download = 6,
    /// Interactive shell
    Shell = 7,
    /// SOCKS proxy session control
    Socks = 8,
    /// Local-to-remote port forward control
    LForward = 9,
    /// Remote-to-local port forward control
    RForward = 10,
    /// Join a node reachable through an operator-provisioned tunnel
    SshConnect = 11,
    /// SOCKS session payload
    SocksData = 64,
    /// Remote-forward session payload
    RForwardData = 65,
    /// Shell session payload
    ShellData = 66,
    /// Local-forward session payload
    LForwardData = 67,
}

impl TryFrom<u16> for CmdTag {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Self::Init),
            2 => Ok(Self::Sync),
            3 => Ok(Self::Listen),
            4 => Ok(Self::Connect),
            5 => Ok(Self::Upload),
            6 => Ok(Self::Download),
            7 => Ok(Self::Shell),
            8 => Ok(Self::Socks),
            9 => Ok(Self::LForward),
            10 => Ok(Self::RForward),
            11 => Ok(Self::SshConnect),
            64 => Ok(Self::SocksData),
            65 => Ok(Self::RForwardData),
            66 => Ok(Self::ShellData),
            67 => Ok(Self::LForwardData),
            other => Err(Error::UnknownTag(other)),
        }
    }
}

impl CmdTag {
    /// True for tags that carry session data rather than a command.
    #[must_use]
    pub fn is_session_data(self) -> bool {
        (self as u16) >= 64
    }
}

/// Fixed-shape frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Identity of the originator
    pub src: NodeId,
    /// Identity of the ultimate recipient
    pub dst: NodeId,
    /// Command tag
    pub tag: CmdTag,
}

/// A decoded frame: header plus the raw body bytes.
///
/// The body is parsed lazily with [`Frame::parse`], selecting the expected
/// body variant for the tag.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The frame header
    pub header: FrameHeader,
    /// Undecoded body bytes
    pub body: Vec<u8>,
}

impl Frame {
    /// Decode the body as the expected variant for this frame's tag.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFrame` when the body does not have the expected
    /// shape or leaves trailing bytes.
    pub fn parse<B: WireBody>(&self) -> Result<B> {
        let mut reader = Reader::new(&self.body);
        let parsed = B::decode(&mut reader)?;
        reader.finish()?;
        Ok(parsed)
    }
}

/// Serialize a body to its raw byte form.
#[must_use]
pub fn encode_body(body: &impl WireBody) -> Vec<u8> {
    let mut writer = Writer::new();
    body.encode(&mut writer);
    writer.into_bytes()
}

/// Seal one frame into its full on-wire byte form.
///
/// # Errors
///
/// Returns a transport error if the CSPRNG or cipher fails.
pub fn encode(sealer: &FrameSealer, header: &FrameHeader, body_bytes: &[u8]) -> Result<Vec<u8>> {
    let inner_len = (INNER_HEADER_SIZE + body_bytes.len()) as u32;

    let mut inner = Vec::with_capacity(4 + inner_len as usize);
    inner.extend_from_slice(&inner_len.to_be_bytes());
    inner.extend_from_slice(header.src.as_bytes());
    inner.extend_from_slice(header.dst.as_bytes());
    inner.extend_from_slice(&(header.tag as u16).to_be_bytes());
    inner.extend_from_slice(body_bytes);
    padding::pad_to_class(&mut inner).map_err(Error::from)?;

    let (nonce, ct) = sealer.seal(&inner, &PROTOCOL_SEPARATOR)?;

    let mut out = Vec::with_capacity(4 + NONCE_SIZE + 4 + ct.len());
    out.extend_from_slice(&PROTOCOL_SEPARATOR);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&(ct.len() as u32).to_be_bytes());
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Open a sealed envelope into a frame.
///
/// # Errors
///
/// `AuthFailure` when the cipher rejects the input; `MalformedFrame` when
/// the inner layout is inconsistent; `UnknownTag` for unregistered tags.
pub fn open_sealed(sealer: &FrameSealer, nonce: &[u8; NONCE_SIZE], ct: &[u8]) -> Result<Frame> {
    let inner = sealer.open(nonce, ct, &PROTOCOL_SEPARATOR)?;

    if inner.len() < 4 {
        return Err(Error::MalformedFrame("inner length missing"));
    }
    let inner_len = u32::from_be_bytes([inner[0], inner[1], inner[2], inner[3]]) as usize;
    if inner_len < INNER_HEADER_SIZE || 4 + inner_len > inner.len() {
        return Err(Error::MalformedFrame("inner length out of bounds"));
    }

    let mut src = [0u8; NODE_ID_SIZE];
    let mut dst = [0u8; NODE_ID_SIZE];
    src.copy_from_slice(&inner[4..4 + NODE_ID_SIZE]);
    dst.copy_from_slice(&inner[4 + NODE_ID_SIZE..4 + 2 * NODE_ID_SIZE]);
    let tag_off = 4 + 2 * NODE_ID_SIZE;
    let tag = u16::from_be_bytes([inner[tag_off], inner[tag_off + 1]]);

    Ok(Frame {
        header: FrameHeader {
            src: NodeId::from_bytes(src),
            dst: NodeId::from_bytes(dst),
            tag: CmdTag::try_from(tag)?,
        },
        body: inner[4 + INNER_HEADER_SIZE..4 + inner_len].to_vec(),
    })
}

/// Decode a complete on-wire buffer into a frame.
///
/// The streaming link reader performs the same steps incrementally; this
/// form serves tests and diagnostics.
///
/// # Errors
///
/// `MalformedFrame` on short buffers or a bad separator, plus the
/// [`open_sealed`] failure modes.
pub fn decode(sealer: &FrameSealer, bytes: &[u8]) -> Result<Frame> {
    let prefix = 4 + NONCE_SIZE + 4;
    if bytes.len() < prefix {
        return Err(Error::MalformedFrame("short frame"));
    }
    if bytes[..4] != PROTOCOL_SEPARATOR {
        return Err(Error::MalformedFrame("bad separator"));
    }

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&bytes[4..4 + NONCE_SIZE]);
    let ct_len = u32::from_be_bytes([
        bytes[4 + NONCE_SIZE],
        bytes[5 + NONCE_SIZE],
        bytes[6 + NONCE_SIZE],
        bytes[7 + NONCE_SIZE],
    ]) as usize;

    if ct_len > MAX_FRAME_SIZE || bytes.len() != prefix + ct_len {
        return Err(Error::MalformedFrame("ciphertext length mismatch"));
    }

    open_sealed(sealer, &nonce, &bytes[prefix..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_crypto::LinkSecret;

    fn sealer() -> FrameSealer {
        FrameSealer::new(LinkSecret::from_passphrase("test overlay").seal_key())
    }

    fn header(tag: CmdTag) -> FrameHeader {
        FrameHeader {
            src: NodeId::from_bytes([0x01; 32]),
            dst: NodeId::from_bytes([0x02; 32]),
            tag,
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let sealer = sealer();
        let body = encode_body(&ListenReq { port: 9000 });
        let bytes = encode(&sealer, &header(CmdTag::Listen), &body).unwrap();

        let frame = decode(&sealer, &bytes).unwrap();
        assert_eq!(frame.header, header(CmdTag::Listen));
        let req: ListenReq = frame.parse().unwrap();
        assert_eq!(req.port, 9000);
    }

    #[test]
    fn test_padding_hides_body_size() {
        let sealer = sealer();
        let small = encode(&sealer, &header(CmdTag::Shell), &[1u8]).unwrap();
        let medium = encode(&sealer, &header(CmdTag::Shell), &[0u8; 100]).unwrap();
        assert_eq!(small.len(), medium.len());
    }

    #[test]
    fn test_bad_separator_rejected() {
        let sealer = sealer();
        let mut bytes = encode(&sealer, &header(CmdTag::Shell), &[1u8]).unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            decode(&sealer, &bytes),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_wrong_secret_is_auth_failure() {
        let a = sealer();
        let b = FrameSealer::new(LinkSecret::from_passphrase("other").seal_key());
        let bytes = encode(&a, &header(CmdTag::Shell), &[1u8]).unwrap();
        assert!(matches!(decode(&b, &bytes), Err(Error::AuthFailure)));
    }

    #[test]
    fn test_tampered_ciphertext_is_auth_failure() {
        let sealer = sealer();
        let mut bytes = encode(&sealer, &header(CmdTag::Shell), &[1u8]).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(decode(&sealer, &bytes), Err(Error::AuthFailure)));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let sealer = sealer();
        // Build a frame with an unregistered tag value by sealing by hand.
        let mut inner = Vec::new();
        let inner_len = (INNER_HEADER_SIZE) as u32;
        inner.extend_from_slice(&inner_len.to_be_bytes());
        inner.extend_from_slice(&[0x01; 32]);
        inner.extend_from_slice(&[0x02; 32]);
        inner.extend_from_slice(&999u16.to_be_bytes());
        let (nonce, ct) = sealer.seal(&inner, &PROTOCOL_SEPARATOR).unwrap();

        assert!(matches!(
            open_sealed(&sealer, &nonce, &ct),
            Err(Error::UnknownTag(999))
        ));
    }

    #[test]
    fn test_short_frame_rejected() {
        let sealer = sealer();
        assert!(matches!(
            decode(&sealer, &[0u8; 8]),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_session_data_tags() {
        assert!(CmdTag::SocksData.is_session_data());
        assert!(CmdTag::ShellData.is_session_data());
        assert!(!CmdTag::Sync.is_session_data());
        assert!(!CmdTag::SshConnect.is_session_data());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_decode_doesnt_panic(data in prop::collection::vec(any::<u8>(), 0..2048)) {
                let _ = decode(&sealer(), &data);
            }

            #[test]
            fn prop_roundtrip_preserves_header_and_body(
                src: [u8; 32],
                dst: [u8; 32],
                session: u16,
                payload in prop::collection::vec(any::<u8>(), 0..4096),
                close in 0u8..=1,
            ) {
                let sealer = sealer();
                let header = FrameHeader {
                    src: NodeId::from_bytes(src),
                    dst: NodeId::from_bytes(dst),
                    tag: CmdTag::SocksData,
                };
                let body = DataBody { session, data: payload, close };
                let bytes = encode(&sealer, &header, &encode_body(&body)).unwrap();

                let frame = decode(&sealer, &bytes).unwrap();
                prop_assert_eq!(frame.header, header);
                prop_assert_eq!(frame.parse::<DataBody>().unwrap(), body);
            }
        }
    }
}
