// MYCOFLOW NETLINK QDISC STATS
// RTM_GETQDISC DUMP OVER A RAW NETLINK_ROUTE SOCKET.
// SUMS THE LEGACY TCA_STATS ATTRIBUTE (backlog/drops/overlimits)
// ACROSS EVERY QDISC ON THE INTERFACE. UNKNOWN MESSAGE TYPES AND
// ATTRIBUTES ARE SKIPPED, NOT ERRORS.

use std::ffi::CString;

use anyhow::{bail, Result};
use log::warn;

const TCA_STATS: u16 = 3;
const NLMSG_HDRLEN: usize = std::mem::size_of::<libc::nlmsghdr>();
const RECV_BUF_LEN: usize = 16384;

// struct tcmsg FROM linux/rtnetlink.h
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct TcMsg {
    tcm_family: u8,
    tcm_pad1: u8,
    tcm_pad2: u16,
    tcm_ifindex: i32,
    tcm_handle: u32,
    tcm_parent: u32,
    tcm_info: u32,
}

// LEGACY struct tc_stats FROM linux/pkt_sched.h (ALWAYS PRESENT,
// UNLIKE THE NESTED TCA_STATS2 VARIANTS)
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct TcStats {
    bytes: u64,
    packets: u32,
    drops: u32,
    overlimits: u32,
    bps: u32,
    pps: u32,
    qlen: u32,
    backlog: u32,
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct QdiscStats {
    pub backlog: u32,
    pub drops: u32,
    pub overlimits: u32,
}

#[derive(PartialEq, Eq, Debug)]
enum DumpOutcome {
    More,
    Done,
    Failed,
}

pub struct NetlinkSocket {
    fd: i32,
    seq: u32,
}

impl NetlinkSocket {
    pub fn open() -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            bail!("netlink socket: {}", std::io::Error::last_os_error());
        }

        let mut sa: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        sa.nl_family = libc::AF_NETLINK as u16;
        let rc = unsafe {
            libc::bind(
                fd,
                &sa as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            bail!("netlink bind: {}", err);
        }

        Ok(Self { fd, seq: 1 })
    }

    // DUMP ALL QDISCS, KEEP THE ONES ON iface, SUM THEIR STATS.
    // None WHEN THE INTERFACE IS GONE OR THE DUMP FAILED.
    pub fn qdisc_stats(&mut self, iface: &str) -> Option<QdiscStats> {
        let name = CString::new(iface).ok()?;
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            return None;
        }

        if !self.send_qdisc_request(ifindex as i32) {
            return None;
        }

        let mut acc = QdiscStats::default();
        let mut buf = [0u8; RECV_BUF_LEN];
        loop {
            let n = unsafe {
                libc::recv(
                    self.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                warn!("netlink recv: {}", err);
                return None;
            }
            match fold_dump(&buf[..n as usize], ifindex as i32, &mut acc) {
                DumpOutcome::More => continue,
                DumpOutcome::Done => return Some(acc),
                DumpOutcome::Failed => return None,
            }
        }
    }

    fn send_qdisc_request(&mut self, ifindex: i32) -> bool {
        #[repr(C)]
        struct QdiscRequest {
            nlh: libc::nlmsghdr,
            tcm: TcMsg,
        }

        let mut req: QdiscRequest = unsafe { std::mem::zeroed() };
        req.nlh.nlmsg_len = std::mem::size_of::<QdiscRequest>() as u32;
        req.nlh.nlmsg_type = libc::RTM_GETQDISC;
        req.nlh.nlmsg_flags = (libc::NLM_F_REQUEST | libc::NLM_F_DUMP) as u16;
        self.seq = self.seq.wrapping_add(1);
        req.nlh.nlmsg_seq = self.seq;
        req.tcm.tcm_family = libc::AF_UNSPEC as u8;
        req.tcm.tcm_ifindex = ifindex;

        let rc = unsafe {
            libc::send(
                self.fd,
                &req as *const QdiscRequest as *const libc::c_void,
                std::mem::size_of::<QdiscRequest>(),
                0,
            )
        };
        if rc < 0 {
            warn!("netlink send: {}", std::io::Error::last_os_error());
            return false;
        }
        true
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

// WALK ONE recv() WORTH OF LENGTH-PREFIXED NETLINK MESSAGES.
// RTM_NEWQDISC RECORDS FOR THE WANTED ifindex CONTRIBUTE THEIR
// TCA_STATS; EVERYTHING ELSE IS SKIPPED.
fn fold_dump(buf: &[u8], ifindex: i32, acc: &mut QdiscStats) -> DumpOutcome {
    let mut off = 0usize;
    while off + NLMSG_HDRLEN <= buf.len() {
        let nlh: libc::nlmsghdr =
            unsafe { std::ptr::read_unaligned(buf[off..].as_ptr() as *const libc::nlmsghdr) };
        let msg_len = nlh.nlmsg_len as usize;
        if msg_len < NLMSG_HDRLEN || off + msg_len > buf.len() {
            return DumpOutcome::Failed;
        }

        if i32::from(nlh.nlmsg_type) == libc::NLMSG_DONE {
            return DumpOutcome::Done;
        }
        if i32::from(nlh.nlmsg_type) == libc::NLMSG_ERROR {
            warn!("netlink dump returned NLMSG_ERROR");
            return DumpOutcome::Failed;
        }
        if nlh.nlmsg_type == libc::RTM_NEWQDISC {
            let payload = &buf[off + NLMSG_HDRLEN..off + msg_len];
            fold_qdisc_message(payload, ifindex, acc);
        }

        off += align4(msg_len);
    }
    DumpOutcome::More
}

fn fold_qdisc_message(payload: &[u8], ifindex: i32, acc: &mut QdiscStats) {
    if payload.len() < std::mem::size_of::<TcMsg>() {
        return;
    }
    let tcm: TcMsg = unsafe { std::ptr::read_unaligned(payload.as_ptr() as *const TcMsg) };
    if tcm.tcm_ifindex != ifindex {
        return;
    }

    let mut off = align4(std::mem::size_of::<TcMsg>());
    while off + 4 <= payload.len() {
        let rta_len = u16::from_ne_bytes([payload[off], payload[off + 1]]) as usize;
        let rta_type = u16::from_ne_bytes([payload[off + 2], payload[off + 3]]);
        if rta_len < 4 || off + rta_len > payload.len() {
            return;
        }
        if rta_type == TCA_STATS && rta_len - 4 >= std::mem::size_of::<TcStats>() {
            let st: TcStats = unsafe {
                std::ptr::read_unaligned(payload[off + 4..].as_ptr() as *const TcStats)
            };
            acc.backlog = acc.backlog.wrapping_add(st.backlog);
            acc.drops = acc.drops.wrapping_add(st.drops);
            acc.overlimits = acc.overlimits.wrapping_add(st.overlimits);
        }
        off += align4(rta_len);
    }
}
