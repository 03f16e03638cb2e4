//! Typed frame bodies and their byte-level encodings.
//!
//! Bodies are flat big-endian records. Variable-length fields carry an
//! explicit length prefix; decoding is strict and rejects trailing bytes at
//! the frame layer.

use crate::NODE_ID_SIZE;
use crate::error::{Error, Result};
use crate::identity::NodeId;
use trellis_crypto::PROBE_SIZE;

/// Byte-level body writer.
pub struct Writer(Vec<u8>);

impl Writer {
    /// Start an empty body.
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// The accumulated body bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Append one byte.
    pub fn put_u8(&mut self, v: u8) {
        self.0.push(v);
    }

    /// Append a big-endian u16.
    pub fn put_u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a big-endian u32.
    pub fn put_u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a big-endian u64.
    pub fn put_u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a node identity verbatim.
    pub fn put_id(&mut self, id: &NodeId) {
        self.0.extend_from_slice(id.as_bytes());
    }

    /// Append raw bytes with no length prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }

    /// Append a u16 length prefix followed by the bytes.
    pub fn put_lp16(&mut self, bytes: &[u8]) {
        self.put_u16(bytes.len() as u16);
        self.put_raw(bytes);
    }

    /// Append a u32 length prefix followed by the bytes.
    pub fn put_lp32(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.put_raw(bytes);
    }

    /// Append a u64 length prefix followed by the bytes.
    pub fn put_lp64(&mut self, bytes: &[u8]) {
        self.put_u64(bytes.len() as u64);
        self.put_raw(bytes);
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte-level body reader; every accessor fails on a short body.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Read from the start of `buf`.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::MalformedFrame("short body"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read one byte.
    ///
    /// # Errors
    ///
    /// `MalformedFrame` on a short body; so all accessors below.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a big-endian u16.
    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian u32.
    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a big-endian u64.
    pub fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read a node identity.
    pub fn id(&mut self) -> Result<NodeId> {
        let b = self.take(NODE_ID_SIZE)?;
        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes.copy_from_slice(b);
        Ok(NodeId::from_bytes(bytes))
    }

    /// Read a u16-length-prefixed byte field.
    pub fn lp16(&mut self) -> Result<Vec<u8>> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Read a u32-length-prefixed byte field.
    pub fn lp32(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Read a u64-length-prefixed byte field.
    pub fn lp64(&mut self) -> Result<Vec<u8>> {
        let len = self.u64()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Read a u16-length-prefixed UTF-8 string.
    pub fn lp16_str(&mut self) -> Result<String> {
        String::from_utf8(self.lp16()?).map_err(|_| Error::MalformedFrame("invalid utf-8"))
    }

    /// Read a u32-length-prefixed UTF-8 string.
    pub fn lp32_str(&mut self) -> Result<String> {
        String::from_utf8(self.lp32()?).map_err(|_| Error::MalformedFrame("invalid utf-8"))
    }

    /// Read `n` raw bytes.
    pub fn raw(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    /// Reject trailing bytes after a complete decode.
    ///
    /// # Errors
    ///
    /// `MalformedFrame` when bytes remain.
    pub fn finish(&self) -> Result<()> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(Error::MalformedFrame("trailing bytes in body"))
        }
    }
}

/// A typed frame body with a fixed byte-level encoding.
pub trait WireBody: Sized {
    /// Append this body's encoding to the writer.
    fn encode(&self, w: &mut Writer);

    /// Decode one body from the reader.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFrame` when the bytes do not have this shape.
    fn decode(r: &mut Reader<'_>) -> Result<Self>;
}

/// Admission step 1: the initiator's one-way secret image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeBody {
    /// BLAKE3 image of the shared secret
    pub probe: [u8; PROBE_SIZE],
}

impl WireBody for ProbeBody {
    fn encode(&self, w: &mut Writer) {
        w.put_raw(&self.probe);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let bytes = r.raw(PROBE_SIZE)?;
        let mut probe = [0u8; PROBE_SIZE];
        probe.copy_from_slice(&bytes);
        Ok(Self { probe })
    }
}

/// Admission step 2: the responder's identity, label and adjacency map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloBody {
    /// Responder identity
    pub id: NodeId,
    /// Responder hostname label
    pub hostname: String,
    /// Responder OS label
    pub os: String,
    /// Serialized adjacency map
    pub map: Vec<u8>,
}

impl WireBody for HelloBody {
    fn encode(&self, w: &mut Writer) {
        w.put_id(&self.id);
        w.put_lp16(self.hostname.as_bytes());
        w.put_lp16(self.os.as_bytes());
        w.put_lp64(&self.map);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            id: r.id()?,
            hostname: r.lp16_str()?,
            os: r.lp16_str()?,
            map: r.lp64()?,
        })
    }
}

/// Admission step 3: the initiator's identity and label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentBody {
    /// Initiator identity
    pub id: NodeId,
    /// Initiator hostname label
    pub hostname: String,
    /// Initiator OS label
    pub os: String,
}

impl WireBody for IdentBody {
    fn encode(&self, w: &mut Writer) {
        w.put_id(&self.id);
        w.put_lp16(self.hostname.as_bytes());
        w.put_lp16(self.os.as_bytes());
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            id: r.id()?,
            hostname: r.lp16_str()?,
            os: r.lp16_str()?,
        })
    }
}

/// Topology synchronization request and reply: a serialized adjacency map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncBody {
    /// Serialized adjacency map
    pub map: Vec<u8>,
}

impl WireBody for SyncBody {
    fn encode(&self, w: &mut Writer) {
        w.put_lp64(&self.map);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { map: r.lp64()? })
    }
}

/// LISTEN request: open a node listener on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenReq {
    /// Port to bind
    pub port: u16,
}

impl WireBody for ListenReq {
    fn encode(&self, w: &mut Writer) {
        w.put_u16(self.port);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { port: r.u16()? })
    }
}

/// Generic success/message reply used by LISTEN, CONNECT, UPLOAD and
/// SSHCONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckBody {
    /// 1 on success, 0 on failure
    pub success: u8,
    /// Error message when `success` is 0
    pub msg: String,
}

impl AckBody {
    /// A successful ack.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: 1,
            msg: String::new(),
        }
    }

    /// A failed ack carrying an error message.
    #[must_use]
    pub fn fail(msg: impl Into<String>) -> Self {
        Self {
            success: 0,
            msg: msg.into(),
        }
    }
}

impl WireBody for AckBody {
    fn encode(&self, w: &mut Writer) {
        w.put_u8(self.success);
        w.put_lp32(self.msg.as_bytes());
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            success: r.u8()?,
            msg: r.lp32_str()?,
        })
    }
}

/// CONNECT request: dial out from the remote node and admit the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectReq {
    /// IPv4 address as a big-endian u32
    pub addr: u32,
    /// Port to dial
    pub port: u16,
}

impl WireBody for ConnectReq {
    fn encode(&self, w: &mut Writer) {
        w.put_u32(self.addr);
        w.put_u16(self.port);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            addr: r.u32()?,
            port: r.u16()?,
        })
    }
}

/// UPLOAD request: one handshake before the data stream begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReq {
    /// Destination path on the remote node
    pub path: String,
    /// Total file size in bytes
    pub file_len: u64,
    /// Exact number of FileData frames that will follow
    pub chunk_count: u64,
}

impl WireBody for UploadReq {
    fn encode(&self, w: &mut Writer) {
        w.put_lp32(self.path.as_bytes());
        w.put_u64(self.file_len);
        w.put_u64(self.chunk_count);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            path: r.lp32_str()?,
            file_len: r.u64()?,
            chunk_count: r.u64()?,
        })
    }
}

/// DOWNLOAD request. `still = 0` probes the file size; `still = 1` asks for
/// the data stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReq {
    /// Path on the remote node
    pub path: String,
    /// 0 = size probe, 1 = stream the file
    pub still: u8,
}

impl WireBody for DownloadReq {
    fn encode(&self, w: &mut Writer) {
        w.put_lp32(self.path.as_bytes());
        w.put_u8(self.still);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            path: r.lp32_str()?,
            still: r.u8()?,
        })
    }
}

/// DOWNLOAD reply: size and the explicit chunk count of the coming stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRep {
    /// 1 on success, 0 on failure
    pub success: u8,
    /// Error message when `success` is 0
    pub msg: String,
    /// File size in bytes
    pub file_len: u64,
    /// `ceil(file_len / chunk)` FileData frames follow a `still = 1` request
    pub chunk_count: u64,
}

impl WireBody for DownloadRep {
    fn encode(&self, w: &mut Writer) {
        w.put_u8(self.success);
        w.put_lp32(self.msg.as_bytes());
        w.put_u64(self.file_len);
        w.put_u64(self.chunk_count);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            success: r.u8()?,
            msg: r.lp32_str()?,
            file_len: r.u64()?,
            chunk_count: r.u64()?,
        })
    }
}

/// One chunk of file data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDataBody {
    /// Chunk bytes, at most `MAX_FILE_CHUNK`
    pub data: Vec<u8>,
}

impl WireBody for FileDataBody {
    fn encode(&self, w: &mut Writer) {
        w.put_lp32(&self.data);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { data: r.lp32()? })
    }
}

/// SHELL request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShellReq {
    /// 1 to start the shell
    pub start: u8,
}

impl WireBody for ShellReq {
    fn encode(&self, w: &mut Writer) {
        w.put_u8(self.start);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { start: r.u8()? })
    }
}

/// SOCKS session control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocksReq {
    /// Session id allocated by the initiator
    pub session: u16,
    /// 1 to start
    pub start: u8,
}

impl WireBody for SocksReq {
    fn encode(&self, w: &mut Writer) {
        w.put_u16(self.session);
        w.put_u8(self.start);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            session: r.u16()?,
            start: r.u8()?,
        })
    }
}

/// LFORWARD control. From the admin with `session = 0` it starts the remote
/// listener; from the agent it announces a freshly allocated session for one
/// accepted connection, echoing the rule fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LForwardBody {
    /// Session id (0 on the initial admin command)
    pub session: u16,
    /// Admin-side port to dial for each session
    pub src_port: u16,
    /// Admin-side IPv4 address to dial
    pub l_host: u32,
    /// Agent-side port to listen on
    pub dst_port: u16,
    /// 1 to start
    pub start: u8,
}

impl WireBody for LForwardBody {
    fn encode(&self, w: &mut Writer) {
        w.put_u16(self.session);
        w.put_u16(self.src_port);
        w.put_u32(self.l_host);
        w.put_u16(self.dst_port);
        w.put_u8(self.start);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            session: r.u16()?,
            src_port: r.u16()?,
            l_host: r.u32()?,
            dst_port: r.u16()?,
            start: r.u8()?,
        })
    }
}

/// RFORWARD request: the agent dials `r_host:src_port` for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RForwardReq {
    /// Session id allocated by the admin
    pub session: u16,
    /// 1 to start
    pub start: u8,
    /// Agent-side IPv4 address to dial
    pub r_host: u32,
    /// Agent-side port to dial
    pub src_port: u16,
}

impl WireBody for RForwardReq {
    fn encode(&self, w: &mut Writer) {
        w.put_u16(self.session);
        w.put_u8(self.start);
        w.put_u32(self.r_host);
        w.put_u16(self.src_port);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            session: r.u16()?,
            start: r.u8()?,
            r_host: r.u32()?,
            src_port: r.u16()?,
        })
    }
}

/// SSHCONNECT request: join a node reachable through an
/// operator-provisioned tunnel endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConnectReq {
    /// Tunnel endpoint IPv4 address
    pub host: u32,
    /// Tunnel endpoint port
    pub port: u16,
    /// Node listener port behind the tunnel
    pub dport: u16,
    /// Username for the tunnel
    pub user: String,
    /// Authentication method (0 = pre-established tunnel)
    pub auth_method: u16,
    /// Authentication material
    pub auth_data: Vec<u8>,
}

impl WireBody for SshConnectReq {
    fn encode(&self, w: &mut Writer) {
        w.put_u32(self.host);
        w.put_u16(self.port);
        w.put_u16(self.dport);
        w.put_lp32(self.user.as_bytes());
        w.put_u16(self.auth_method);
        w.put_lp32(&self.auth_data);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            host: r.u32()?,
            port: r.u16()?,
            dport: r.u16()?,
            user: r.lp32_str()?,
            auth_method: r.u16()?,
            auth_data: r.lp32()?,
        })
    }
}

/// Session data payload for every `*DATA` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBody {
    /// Session id within the (peer, service) scope
    pub session: u16,
    /// Payload bytes
    pub data: Vec<u8>,
    /// 1 marks the session closed after `data`
    pub close: u8,
}

impl DataBody {
    /// A close marker with no payload.
    #[must_use]
    pub fn close_marker(session: u16) -> Self {
        Self {
            session,
            data: Vec::new(),
            close: 1,
        }
    }
}

impl WireBody for DataBody {
    fn encode(&self, w: &mut Writer) {
        w.put_u16(self.session);
        w.put_lp32(&self.data);
        w.put_u8(self.close);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            session: r.u16()?,
            data: r.lp32()?,
            close: r.u8()?,
        })
    }
}
