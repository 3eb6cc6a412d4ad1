//! Live capture from a network interface through an AF_PACKET socket.
//!
//! The socket is bound to one interface, put into promiscuous mode and
//! given a short receive timeout so the capture loop can observe the
//! shutdown flag between bursts.

use std::ffi::CString;
use std::io;

use crate::error::ProbeError;
use crate::input::{PacketFilter, PacketReceiver, ReadStatus};
use crate::packet::{MAX_PKT_SIZE, PacketBlock};
use crate::parser::parse_frame;
use crate::time::now_unix;

const RECV_TIMEOUT_USEC: i64 = 100_000;

pub struct RawSocketReader {
    fd: i32,
    snaplen: usize,
    filter: Option<PacketFilter>,
    buf: Vec<u8>,
    seen: u64,
    parsed: u64,
}

impl RawSocketReader {
    pub fn open(
        ifname: &str,
        snaplen: usize,
        filter: Option<PacketFilter>,
    ) -> Result<RawSocketReader, ProbeError> {
        let name = CString::new(ifname)
            .map_err(|_| ProbeError::Capture(format!("bad interface name {:?}", ifname)))?;

        // SAFETY: plain socket syscalls on owned values; the fd is closed
        // in Drop.
        unsafe {
            let proto = (libc::ETH_P_ALL as u16).to_be();
            let fd = libc::socket(libc::AF_PACKET, libc::SOCK_RAW, i32::from(proto));
            if fd < 0 {
                return Err(capture_errno("cannot open AF_PACKET socket"));
            }

            let ifindex = libc::if_nametoindex(name.as_ptr());
            if ifindex == 0 {
                libc::close(fd);
                return Err(ProbeError::Capture(format!(
                    "unknown interface {:?}",
                    ifname
                )));
            }

            let mut sll: libc::sockaddr_ll = std::mem::zeroed();
            sll.sll_family = libc::AF_PACKET as u16;
            sll.sll_protocol = proto;
            sll.sll_ifindex = ifindex as i32;
            if libc::bind(
                fd,
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            ) < 0
            {
                let err = capture_errno("cannot bind capture socket");
                libc::close(fd);
                return Err(err);
            }

            let mut mreq: libc::packet_mreq = std::mem::zeroed();
            mreq.mr_ifindex = ifindex as i32;
            mreq.mr_type = libc::PACKET_MR_PROMISC as u16;
            if libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                libc::PACKET_ADD_MEMBERSHIP,
                &mreq as *const libc::packet_mreq as *const libc::c_void,
                std::mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
            ) < 0
            {
                let err = capture_errno("cannot enable promiscuous mode");
                libc::close(fd);
                return Err(err);
            }

            let tv = libc::timeval {
                tv_sec: 0,
                tv_usec: RECV_TIMEOUT_USEC as libc::suseconds_t,
            };
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            ) < 0
            {
                let err = capture_errno("cannot set receive timeout");
                libc::close(fd);
                return Err(err);
            }

            Ok(RawSocketReader {
                fd,
                snaplen,
                filter,
                buf: vec![0u8; MAX_PKT_SIZE.max(snaplen)],
                seen: 0,
                parsed: 0,
            })
        }
    }
}

impl PacketReceiver for RawSocketReader {
    fn receive(&mut self, block: &mut PacketBlock) -> Result<ReadStatus, ProbeError> {
        block.clear();

        while block.cnt < block.capacity() {
            // SAFETY: buf outlives the call and the length is its size.
            let n = unsafe {
                libc::recv(
                    self.fd,
                    self.buf.as_mut_ptr() as *mut libc::c_void,
                    self.buf.len(),
                    0,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => {
                        return if block.cnt > 0 {
                            Ok(ReadStatus::Data)
                        } else {
                            Ok(ReadStatus::Timeout)
                        };
                    }
                    _ => {
                        return Err(ProbeError::Capture(format!(
                            "capture read failed: {}",
                            err
                        )));
                    }
                }
            }

            self.seen += 1;
            let data = &self.buf[..n as usize];
            let pkt = &mut block.pkts[block.cnt];
            let ok = parse_frame(now_unix(), data, self.snaplen, pkt)
                && self.filter.as_ref().is_none_or(|f| f.matches(pkt));
            if ok {
                self.parsed += 1;
                block.bytes += data.len() as u64;
                block.cnt += 1;
            }
        }
        Ok(ReadStatus::Data)
    }

    fn seen(&self) -> u64 {
        self.seen
    }

    fn parsed(&self) -> u64 {
        self.parsed
    }
}

impl Drop for RawSocketReader {
    fn drop(&mut self) {
        // SAFETY: fd is owned by this reader.
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn capture_errno(what: &str) -> ProbeError {
    ProbeError::Capture(format!("{}: {}", what, io::Error::last_os_error()))
}
