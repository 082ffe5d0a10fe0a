//! Selective-repeat ARQ engine.
//!
//! A sans-io KCP implementation: the caller feeds received datagrams to
//! [`Kcp::input`], drives time with [`Kcp::update`], and receives outgoing
//! datagrams through the output callback. Reliability comes from per-segment
//! sequence numbers, cumulative `una` plus selective ACKs, an adaptive RTO
//! (Jacobson/Karels) and fast retransmit after `fastresend` skipped ACKs.
//!
//! ```text
//! segment header (24 bytes, little-endian)
//! ┌──────┬─────┬─────┬─────┬──────┬──────┬──────┬──────┬──────────┐
//! │ conv │ cmd │ frg │ wnd │  ts  │  sn  │ una  │ len  │ data ... │
//! │ u32  │ u8  │ u8  │ u16 │ u32  │ u32  │ u32  │ u32  │          │
//! └──────┴─────┴─────┴─────┴──────┴──────┴──────┴──────┴──────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;

/// Per-segment header size.
pub const KCP_OVERHEAD: usize = 24;

const RTO_NDL: u32 = 30;
const RTO_MIN: u32 = 100;
const RTO_DEF: u32 = 200;
const RTO_MAX: u32 = 60_000;

const CMD_PUSH: u8 = 81;
const CMD_ACK: u8 = 82;
const CMD_WASK: u8 = 83;
const CMD_WINS: u8 = 84;

const ASK_SEND: u32 = 1;
const ASK_TELL: u32 = 2;

const WND_SND: u16 = 32;
const WND_RCV: u16 = 128;
const MTU_DEF: usize = 1400;
const INTERVAL: u32 = 100;
const DEADLINK: u32 = 20;
const THRESH_INIT: u32 = 2;
const THRESH_MIN: u32 = 2;
const PROBE_INIT: u32 = 7_000;
const PROBE_LIMIT: u32 = 120_000;
const FASTACK_LIMIT: u32 = 5;

/// Signed distance between two wrapping millisecond/sequence counters.
#[inline]
fn timediff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// ARQ errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KcpError {
    /// No complete message is waiting.
    #[error("no message available")]
    Empty,
    /// A message would need more fragments than the receive window allows.
    #[error("message needs {0} fragments")]
    TooManyFragments(usize),
    /// Datagram shorter than its headers claim.
    #[error("truncated segment")]
    Truncated,
    /// Segment for another conversation.
    #[error("conversation mismatch: expected {expected}, got {got}")]
    ConvMismatch {
        /// Local conversation id.
        expected: u32,
        /// Received conversation id.
        got: u32,
    },
    /// Unknown command byte.
    #[error("invalid command {0}")]
    InvalidCommand(u8),
    /// MTU too small to carry a header.
    #[error("invalid mtu {0}")]
    InvalidMtu(usize),
}

#[derive(Debug, Clone, Default)]
struct Segment {
    conv: u32,
    cmd: u8,
    frg: u8,
    wnd: u16,
    ts: u32,
    sn: u32,
    una: u32,
    resendts: u32,
    rto: u32,
    fastack: u32,
    xmit: u32,
    data: Bytes,
}

impl Segment {
    fn encode_header(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd);
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.data.len() as u32);
    }
}

/// Datagram sink invoked from `flush`.
pub type KcpOutput = Box<dyn FnMut(&[u8]) + Send>;

fn emit(buffer: &mut BytesMut, output: &mut KcpOutput) {
    if !buffer.is_empty() {
        output(&buffer[..]);
        buffer.clear();
    }
}

/// One ARQ conversation.
pub struct Kcp {
    conv: u32,
    mtu: usize,
    mss: usize,
    dead: bool,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    ssthresh: u32,
    rx_rttval: i32,
    rx_srtt: i32,
    rx_rto: u32,
    rx_minrto: u32,

    snd_wnd: u16,
    rcv_wnd: u16,
    rmt_wnd: u16,
    cwnd: u32,
    probe: u32,

    current: u32,
    interval: u32,
    ts_flush: u32,
    xmit: u32,
    nodelay: u32,
    updated: bool,

    ts_probe: u32,
    probe_wait: u32,
    dead_link: u32,
    incr: u32,

    fastresend: u32,
    fastlimit: u32,
    nocwnd: bool,

    snd_queue: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,
    acklist: Vec<(u32, u32)>,

    buffer: BytesMut,
    output: KcpOutput,
}

impl Kcp {
    /// New conversation `conv` writing datagrams to `output`.
    pub fn new(conv: u32, output: KcpOutput) -> Self {
        Self {
            conv,
            mtu: MTU_DEF,
            mss: MTU_DEF - KCP_OVERHEAD,
            dead: false,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            ssthresh: THRESH_INIT,
            rx_rttval: 0,
            rx_srtt: 0,
            rx_rto: RTO_DEF,
            rx_minrto: RTO_MIN,
            snd_wnd: WND_SND,
            rcv_wnd: WND_RCV,
            rmt_wnd: WND_RCV,
            cwnd: 0,
            probe: 0,
            current: 0,
            interval: INTERVAL,
            ts_flush: INTERVAL,
            xmit: 0,
            nodelay: 0,
            updated: false,
            ts_probe: 0,
            probe_wait: 0,
            dead_link: DEADLINK,
            incr: 0,
            fastresend: 0,
            fastlimit: FASTACK_LIMIT,
            nocwnd: false,
            snd_queue: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            acklist: Vec::new(),
            buffer: BytesMut::with_capacity((MTU_DEF + KCP_OVERHEAD) * 3),
            output,
        }
    }

    /// Conversation id.
    pub fn conv(&self) -> u32 {
        self.conv
    }

    // =========================================================================
    // USER INTERFACE
    // =========================================================================

    /// Size of the next complete message, if one is ready.
    pub fn peek_size(&self) -> Option<usize> {
        let front = self.rcv_queue.front()?;
        if front.frg == 0 {
            return Some(front.data.len());
        }
        if self.rcv_queue.len() < front.frg as usize + 1 {
            return None;
        }
        let mut size = 0;
        for seg in &self.rcv_queue {
            size += seg.data.len();
            if seg.frg == 0 {
                break;
            }
        }
        Some(size)
    }

    /// Pop the next complete message.
    pub fn recv(&mut self) -> Result<Bytes, KcpError> {
        let size = self.peek_size().ok_or(KcpError::Empty)?;
        let recover = self.rcv_queue.len() >= self.rcv_wnd as usize;

        let mut message = BytesMut::with_capacity(size);
        while let Some(seg) = self.rcv_queue.pop_front() {
            message.extend_from_slice(&seg.data);
            if seg.frg == 0 {
                break;
            }
        }

        self.move_rcv_buf();

        // Window reopened; tell the peer right away.
        if recover && self.rcv_queue.len() < self.rcv_wnd as usize {
            self.probe |= ASK_TELL;
        }
        Ok(message.freeze())
    }

    /// Queue a message, fragmenting it to the MSS.
    pub fn send(&mut self, data: &[u8]) -> Result<usize, KcpError> {
        let count = if data.len() <= self.mss {
            1
        } else {
            (data.len() + self.mss - 1) / self.mss
        };
        if count >= WND_RCV as usize {
            return Err(KcpError::TooManyFragments(count));
        }

        let mut chunks = data.chunks(self.mss.max(1));
        for i in 0..count {
            let chunk = chunks.next().unwrap_or(&[]);
            self.snd_queue.push_back(Segment {
                frg: (count - i - 1) as u8,
                data: Bytes::copy_from_slice(chunk),
                ..Default::default()
            });
        }
        Ok(data.len())
    }

    /// Segments waiting to be sent or acknowledged.
    pub fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    /// True once a segment exceeded the retransmission limit.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    // =========================================================================
    // INPUT
    // =========================================================================

    fn update_ack(&mut self, rtt: i32) {
        // `ts` is echoed by the peer; samples beyond RTO_MAX are not RTTs.
        if !(0..=RTO_MAX as i32).contains(&rtt) {
            return;
        }
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttval = rtt / 2;
        } else {
            let delta = (rtt - self.rx_srtt).abs();
            self.rx_rttval = (3 * self.rx_rttval + delta) / 4;
            self.rx_srtt = ((7 * self.rx_srtt + rtt) / 8).max(1);
        }
        let rto = self.rx_srtt as i64 + (self.interval as i64).max(4 * self.rx_rttval as i64);
        self.rx_rto = rto.clamp(self.rx_minrto as i64, RTO_MAX as i64) as u32;
    }

    fn shrink_buf(&mut self) {
        self.snd_una = self.snd_buf.front().map(|s| s.sn).unwrap_or(self.snd_nxt);
    }

    fn parse_ack(&mut self, sn: u32) {
        if timediff(sn, self.snd_una) < 0 || timediff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for i in 0..self.snd_buf.len() {
            let seg_sn = self.snd_buf[i].sn;
            if seg_sn == sn {
                self.snd_buf.remove(i);
                break;
            }
            if timediff(sn, seg_sn) < 0 {
                break;
            }
        }
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(seg) = self.snd_buf.front() {
            if timediff(una, seg.sn) > 0 {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn parse_fastack(&mut self, sn: u32) {
        if timediff(sn, self.snd_una) < 0 || timediff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for seg in self.snd_buf.iter_mut() {
            if timediff(sn, seg.sn) < 0 {
                break;
            } else if sn != seg.sn {
                seg.fastack += 1;
            }
        }
    }

    fn parse_data(&mut self, seg: Segment) {
        let sn = seg.sn;
        if timediff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd as u32)) >= 0 || timediff(sn, self.rcv_nxt) < 0 {
            return;
        }

        let mut insert_at = self.rcv_buf.len();
        let mut repeat = false;
        for (i, existing) in self.rcv_buf.iter().enumerate().rev() {
            if existing.sn == sn {
                repeat = true;
                break;
            }
            if timediff(sn, existing.sn) > 0 {
                insert_at = i + 1;
                break;
            }
            insert_at = i;
        }
        if !repeat {
            self.rcv_buf.insert(insert_at, seg);
        }

        self.move_rcv_buf();
    }

    fn move_rcv_buf(&mut self) {
        while let Some(seg) = self.rcv_buf.front() {
            if seg.sn == self.rcv_nxt && self.rcv_queue.len() < self.rcv_wnd as usize {
                if let Some(seg) = self.rcv_buf.pop_front() {
                    self.rcv_queue.push_back(seg);
                }
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            } else {
                break;
            }
        }
    }

    /// Feed one received datagram (possibly several segments).
    pub fn input(&mut self, data: &[u8]) -> Result<usize, KcpError> {
        if data.len() < KCP_OVERHEAD {
            return Err(KcpError::Truncated);
        }

        let prev_una = self.snd_una;
        let mut maxack: Option<u32> = None;
        let mut buf = data;

        while buf.len() >= KCP_OVERHEAD {
            let conv = buf.get_u32_le();
            if conv != self.conv {
                return Err(KcpError::ConvMismatch {
                    expected: self.conv,
                    got: conv,
                });
            }
            let cmd = buf.get_u8();
            let frg = buf.get_u8();
            let wnd = buf.get_u16_le();
            let ts = buf.get_u32_le();
            let sn = buf.get_u32_le();
            let una = buf.get_u32_le();
            let len = buf.get_u32_le() as usize;

            if buf.len() < len {
                return Err(KcpError::Truncated);
            }
            if !matches!(cmd, CMD_PUSH | CMD_ACK | CMD_WASK | CMD_WINS) {
                return Err(KcpError::InvalidCommand(cmd));
            }

            self.rmt_wnd = wnd;
            self.parse_una(una);
            self.shrink_buf();

            match cmd {
                CMD_ACK => {
                    self.update_ack(timediff(self.current, ts));
                    self.parse_ack(sn);
                    self.shrink_buf();
                    maxack = match maxack {
                        Some(max) if timediff(sn, max) <= 0 => Some(max),
                        _ => Some(sn),
                    };
                }
                CMD_PUSH => {
                    if timediff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd as u32)) < 0 {
                        self.acklist.push((sn, ts));
                        if timediff(sn, self.rcv_nxt) >= 0 {
                            self.parse_data(Segment {
                                conv,
                                cmd,
                                frg,
                                wnd,
                                ts,
                                sn,
                                una,
                                data: Bytes::copy_from_slice(&buf[..len]),
                                ..Default::default()
                            });
                        }
                    }
                }
                CMD_WASK => self.probe |= ASK_TELL,
                _ => {}
            }

            buf.advance(len);
        }

        if let Some(max) = maxack {
            self.parse_fastack(max);
        }

        if timediff(self.snd_una, prev_una) > 0 && self.cwnd < self.rmt_wnd as u32 {
            let mss = self.mss as u32;
            if self.cwnd < self.ssthresh {
                self.cwnd += 1;
                self.incr += mss;
            } else {
                if self.incr < mss {
                    self.incr = mss;
                }
                self.incr += (mss * mss) / self.incr + mss / 16;
                if (self.cwnd + 1) * mss <= self.incr {
                    self.cwnd = (self.incr + mss - 1) / mss.max(1);
                }
            }
            if self.cwnd > self.rmt_wnd as u32 {
                self.cwnd = self.rmt_wnd as u32;
                self.incr = self.rmt_wnd as u32 * mss;
            }
        }

        Ok(data.len() - buf.len())
    }

    // =========================================================================
    // OUTPUT
    // =========================================================================

    fn wnd_unused(&self) -> u16 {
        let used = self.rcv_queue.len();
        if used < self.rcv_wnd as usize {
            self.rcv_wnd - used as u16
        } else {
            0
        }
    }

    /// Emit pending ACKs, probes and data.
    pub fn flush(&mut self) {
        if !self.updated {
            return;
        }
        let current = self.current;
        let wnd = self.wnd_unused();
        let mtu = self.mtu;

        let mut header = Segment {
            conv: self.conv,
            cmd: CMD_ACK,
            wnd,
            una: self.rcv_nxt,
            ..Default::default()
        };

        for &(sn, ts) in &self.acklist {
            if self.buffer.len() + KCP_OVERHEAD > mtu {
                emit(&mut self.buffer, &mut self.output);
            }
            header.sn = sn;
            header.ts = ts;
            header.encode_header(&mut self.buffer);
        }
        self.acklist.clear();

        // Remote window closed: probe it.
        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT;
                self.ts_probe = current.wrapping_add(self.probe_wait);
            } else if timediff(current, self.ts_probe) >= 0 {
                self.probe_wait = self.probe_wait.max(PROBE_INIT);
                self.probe_wait += self.probe_wait / 2;
                self.probe_wait = self.probe_wait.min(PROBE_LIMIT);
                self.ts_probe = current.wrapping_add(self.probe_wait);
                self.probe |= ASK_SEND;
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }

        header.sn = 0;
        header.ts = 0;
        for (flag, cmd) in [(ASK_SEND, CMD_WASK), (ASK_TELL, CMD_WINS)] {
            if self.probe & flag != 0 {
                header.cmd = cmd;
                if self.buffer.len() + KCP_OVERHEAD > mtu {
                    emit(&mut self.buffer, &mut self.output);
                }
                header.encode_header(&mut self.buffer);
            }
        }
        self.probe = 0;

        let mut cwnd = (self.snd_wnd as u32).min(self.rmt_wnd as u32);
        if !self.nocwnd {
            cwnd = cwnd.min(self.cwnd);
        }

        while timediff(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) < 0 {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            seg.conv = self.conv;
            seg.cmd = CMD_PUSH;
            seg.wnd = wnd;
            seg.ts = current;
            seg.sn = self.snd_nxt;
            seg.una = self.rcv_nxt;
            seg.resendts = current;
            seg.rto = self.rx_rto;
            seg.fastack = 0;
            seg.xmit = 0;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(seg);
        }

        let resent = if self.fastresend > 0 { self.fastresend } else { u32::MAX };
        let rtomin = if self.nodelay == 0 { self.rx_rto >> 3 } else { 0 };
        let mut lost = false;
        let mut change = 0u32;

        for seg in self.snd_buf.iter_mut() {
            let mut needsend = false;
            if seg.xmit == 0 {
                needsend = true;
                seg.xmit += 1;
                seg.rto = self.rx_rto;
                seg.resendts = current.wrapping_add(seg.rto + rtomin);
            } else if timediff(current, seg.resendts) >= 0 {
                needsend = true;
                seg.xmit += 1;
                self.xmit += 1;
                if self.nodelay == 0 {
                    seg.rto += seg.rto.max(self.rx_rto);
                } else {
                    let step = if self.nodelay < 2 { seg.rto } else { self.rx_rto };
                    seg.rto += step / 2;
                }
                seg.resendts = current.wrapping_add(seg.rto);
                lost = true;
            } else if seg.fastack >= resent && (seg.xmit <= self.fastlimit || self.fastlimit == 0) {
                needsend = true;
                seg.xmit += 1;
                seg.fastack = 0;
                seg.resendts = current.wrapping_add(seg.rto);
                change += 1;
            }

            if needsend {
                seg.ts = current;
                seg.wnd = wnd;
                seg.una = self.rcv_nxt;

                if self.buffer.len() + KCP_OVERHEAD + seg.data.len() > mtu {
                    emit(&mut self.buffer, &mut self.output);
                }
                seg.encode_header(&mut self.buffer);
                self.buffer.extend_from_slice(&seg.data);

                #[cfg(feature = "debug-tracing")]
                tracing::trace!(conv = self.conv, sn = seg.sn, xmit = seg.xmit, "kcp segment out");

                if seg.xmit >= self.dead_link {
                    self.dead = true;
                }
            }
        }

        emit(&mut self.buffer, &mut self.output);

        if change > 0 {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = (inflight / 2).max(THRESH_MIN);
            self.cwnd = self.ssthresh + resent;
            self.incr = self.cwnd * self.mss as u32;
        }
        if lost {
            self.ssthresh = (cwnd / 2).max(THRESH_MIN);
            self.cwnd = 1;
            self.incr = self.mss as u32;
        }
        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = self.mss as u32;
        }
    }

    /// Advance the clock to `current` (ms) and flush when due.
    pub fn update(&mut self, current: u32) {
        self.current = current;
        if !self.updated {
            self.updated = true;
            self.ts_flush = current;
        }

        let mut slap = timediff(current, self.ts_flush);
        if !(-10_000..10_000).contains(&slap) {
            self.ts_flush = current;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if timediff(current, self.ts_flush) >= 0 {
                self.ts_flush = current.wrapping_add(self.interval);
            }
            self.flush();
        }
    }

    /// When `update` should next be called.
    pub fn check(&self, current: u32) -> u32 {
        if !self.updated {
            return current;
        }
        let mut ts_flush = self.ts_flush;
        if !(-10_000..10_000).contains(&timediff(current, ts_flush)) {
            ts_flush = current;
        }
        if timediff(current, ts_flush) >= 0 {
            return current;
        }

        let tm_flush = timediff(ts_flush, current) as u32;
        let mut tm_packet = u32::MAX;
        for seg in &self.snd_buf {
            let diff = timediff(seg.resendts, current);
            if diff <= 0 {
                return current;
            }
            tm_packet = tm_packet.min(diff as u32);
        }

        let minimal = tm_packet.min(tm_flush).min(self.interval);
        current.wrapping_add(minimal)
    }

    // =========================================================================
    // TUNING
    // =========================================================================

    /// Set the datagram MTU.
    pub fn set_mtu(&mut self, mtu: usize) -> Result<(), KcpError> {
        if mtu < 50 || mtu < KCP_OVERHEAD {
            return Err(KcpError::InvalidMtu(mtu));
        }
        self.mtu = mtu;
        self.mss = mtu - KCP_OVERHEAD;
        self.buffer = BytesMut::with_capacity((mtu + KCP_OVERHEAD) * 3);
        Ok(())
    }

    /// Set send and receive windows (in segments).
    pub fn set_wndsize(&mut self, snd_wnd: u16, rcv_wnd: u16) {
        if snd_wnd > 0 {
            self.snd_wnd = snd_wnd;
        }
        if rcv_wnd > 0 {
            // Must hold a maximum-size fragmented message.
            self.rcv_wnd = rcv_wnd.max(WND_RCV);
        }
    }

    /// Latency tuning: `nodelay` (0 off, 1 on, 2 aggressive), update
    /// interval, fast-resend skip count (0 off), and congestion control off.
    pub fn set_nodelay(&mut self, nodelay: u32, interval: u32, resend: u32, no_congestion: bool) {
        self.nodelay = nodelay;
        self.rx_minrto = if nodelay > 0 { RTO_NDL } else { RTO_MIN };
        self.interval = interval.clamp(10, 5000);
        self.fastresend = resend;
        self.nocwnd = no_congestion;
    }

    /// Retransmissions after which the link counts as dead.
    pub fn set_dead_link(&mut self, limit: u32) {
        self.dead_link = limit;
    }

    /// Current retransmission timeout (ms).
    pub fn rto(&self) -> u32 {
        self.rx_rto
    }
}

impl std::fmt::Debug for Kcp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kcp")
            .field("conv", &self.conv)
            .field("snd_una", &self.snd_una)
            .field("snd_nxt", &self.snd_nxt)
            .field("rcv_nxt", &self.rcv_nxt)
            .field("rto", &self.rx_rto)
            .field("wait_snd", &self.wait_snd())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    type Wire = Arc<Mutex<VecDeque<Vec<u8>>>>;

    fn endpoint(conv: u32) -> (Kcp, Wire) {
        let wire: Wire = Arc::new(Mutex::new(VecDeque::new()));
        let out = wire.clone();
        let mut kcp = Kcp::new(conv, Box::new(move |data: &[u8]| out.lock().push_back(data.to_vec())));
        kcp.set_nodelay(1, 10, 2, true);
        kcp.set_wndsize(128, 128);
        (kcp, wire)
    }

    /// Pumps both directions until `b` has received `expected` messages.
    /// `drop_a` decides per datagram index whether a→b traffic is lost.
    fn run_link(
        messages: &[Vec<u8>],
        mut drop_a: impl FnMut(usize) -> bool,
        max_ms: u32,
    ) -> Vec<Bytes> {
        let (mut a, wire_a) = endpoint(7);
        let (mut b, wire_b) = endpoint(7);
        for message in messages {
            a.send(message).unwrap();
        }

        let mut received = Vec::new();
        let mut sent_index = 0;
        let mut now = 0u32;
        while now < max_ms && received.len() < messages.len() {
            a.update(now);
            b.update(now);

            let outgoing: Vec<_> = wire_a.lock().drain(..).collect();
            for datagram in outgoing {
                let lost = drop_a(sent_index);
                sent_index += 1;
                if !lost {
                    b.input(&datagram).unwrap();
                }
            }
            let acks: Vec<_> = wire_b.lock().drain(..).collect();
            for datagram in acks {
                a.input(&datagram).unwrap();
            }
            while let Ok(message) = b.recv() {
                received.push(message);
            }
            now += 10;
        }
        received
    }

    #[test]
    fn test_lossless_in_order() {
        let messages: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; 100]).collect();
        let received = run_link(&messages, |_| false, 2_000);
        assert_eq!(received.len(), 20);
        for (got, want) in received.iter().zip(&messages) {
            assert_eq!(&got[..], &want[..]);
        }
    }

    #[test]
    fn test_single_drop_recovered() {
        let messages: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 64]).collect();
        // First datagram carries all ten segments; losing it forces retransmission.
        let received = run_link(&messages, |i| i == 0, 5_000);
        assert_eq!(received.len(), 10);
        for (got, want) in received.iter().zip(&messages) {
            assert_eq!(&got[..], &want[..]);
        }
    }

    #[test]
    fn test_fragmented_message() {
        let big: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let received = run_link(&[big.clone()], |i| i == 1, 5_000);
        assert_eq!(received.len(), 1);
        assert_eq!(&received[0][..], &big[..]);
    }

    #[test]
    fn test_peek_size_waits_for_all_fragments() {
        let (mut a, wire_a) = endpoint(1);
        let (mut b, _wire_b) = endpoint(1);
        a.set_mtu(100).unwrap();
        a.send(&[9u8; 200]).unwrap();
        a.update(0);

        let datagrams: Vec<_> = wire_a.lock().drain(..).collect();
        assert!(datagrams.len() >= 3);
        b.input(&datagrams[0]).unwrap();
        assert_eq!(b.peek_size(), None);
        for datagram in &datagrams[1..] {
            b.input(datagram).unwrap();
        }
        assert_eq!(b.peek_size(), Some(200));
        assert_eq!(b.recv().unwrap().len(), 200);
        assert_eq!(b.recv(), Err(KcpError::Empty));
    }

    #[test]
    fn test_conv_mismatch_rejected() {
        let (mut a, wire_a) = endpoint(1);
        let (mut b, _) = endpoint(2);
        a.send(b"hi").unwrap();
        a.update(0);
        let datagram = wire_a.lock().pop_front().unwrap();
        assert_eq!(b.input(&datagram), Err(KcpError::ConvMismatch { expected: 2, got: 1 }));
        assert_eq!(b.input(&[0u8; 3]), Err(KcpError::Truncated));
    }

    #[test]
    fn test_rto_adapts_to_rtt() {
        let (mut a, _) = endpoint(1);
        let before = a.rto();
        a.update_ack(40);
        a.update_ack(40);
        assert!(a.rto() < before);
        assert!(a.rto() >= RTO_NDL);
    }

    fn ack_segment(conv: u32, ts: u32, sn: u32, una: u32) -> Vec<u8> {
        let seg = Segment {
            conv,
            cmd: CMD_ACK,
            wnd: WND_RCV,
            ts,
            sn,
            una,
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        seg.encode_header(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn test_ack_with_ancient_timestamp_ignored() {
        let (mut a, _) = endpoint(1);
        a.update(1000);
        a.update_ack(40);
        let before = a.rto();

        let forged = ack_segment(1, 1000u32.wrapping_sub(0x7FFF_FF00), 0, 0);
        assert!(a.input(&forged).is_ok());
        assert_eq!(a.rto(), before);

        // Just past the limit is dropped too; within it still counts.
        a.update_ack(RTO_MAX as i32 + 1);
        assert_eq!(a.rto(), before);
        a.update_ack(RTO_MAX as i32);
        assert!(a.rto() > before);
        assert!(a.rto() <= RTO_MAX);
    }

    #[test]
    fn test_too_many_fragments() {
        let (mut a, _) = endpoint(1);
        let huge = vec![0u8; (MTU_DEF - KCP_OVERHEAD) * WND_RCV as usize];
        assert!(matches!(a.send(&huge), Err(KcpError::TooManyFragments(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_one_drop_in_n_reassembles(count in 1usize..40, size in 1usize..3000, drop_at in 0usize..6) {
            let mut rng = rand::rngs::StdRng::seed_from_u64((count * 31 + size) as u64);
            let messages: Vec<Vec<u8>> = (0..count)
                .map(|_| (0..rng.gen_range(1..=size)).map(|_| rng.gen()).collect())
                .collect();

            let received = run_link(&messages, |i| i == drop_at, 20_000);
            prop_assert_eq!(received.len(), messages.len());
            for (got, want) in received.iter().zip(&messages) {
                prop_assert_eq!(&got[..], &want[..]);
            }
        }
    }
}
