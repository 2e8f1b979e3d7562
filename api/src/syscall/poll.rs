//! `poll`: readiness over a set of descriptors, with a timeout.

use axerrno::LinuxResult;
use keel_core::sched::WaitQueue;
use keel_core::time;
use keel_core::vfs::IoEvents;
use linux_raw_sys::general::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, pollfd};

use crate::file::get_description;
use crate::mm::UserPtr;

fn to_poll_bits(events: IoEvents) -> u16 {
    let mut bits = 0u16;
    if events.contains(IoEvents::IN) {
        bits |= POLLIN as u16;
    }
    if events.contains(IoEvents::OUT) {
        bits |= POLLOUT as u16;
    }
    if events.contains(IoEvents::HUP) {
        bits |= POLLHUP as u16;
    }
    if events.contains(IoEvents::ERR) {
        bits |= POLLERR as u16;
    }
    bits
}

fn survey(fds: &mut [pollfd]) -> usize {
    let mut ready = 0;
    for entry in fds.iter_mut() {
        if entry.fd < 0 {
            entry.revents = 0;
            continue;
        }
        let revents = match get_description(entry.fd) {
            Ok(desc) => {
                let wanted = entry.events as u16 | POLLHUP as u16 | POLLERR as u16;
                to_poll_bits(desc.poll()) & wanted
            }
            Err(_) => POLLNVAL as u16,
        };
        entry.revents = revents as i16;
        if revents != 0 {
            ready += 1;
        }
    }
    ready
}

/// Nothing ever queues here; timed waits re-poll between yields.
static POLL_WQ: WaitQueue = WaitQueue::new();

pub fn sys_poll(fds: UserPtr<pollfd>, nfds: usize, timeout_ms: i64) -> LinuxResult<isize> {
    let fds = fds.get_as_mut_slice(nfds)?;
    debug!("sys_poll <= {} fds, timeout {}ms", nfds, timeout_ms);

    let deadline = match timeout_ms {
        t if t < 0 => u64::MAX,
        0 => 0,
        t => time::monotonic_us().saturating_add(t as u64 * 1000),
    };

    let ready = POLL_WQ
        .wait_timeout_until(deadline, || {
            let ready = survey(fds);
            if ready > 0 { Some(ready) } else { None }
        })
        .unwrap_or(0);
    Ok(ready as isize)
}
