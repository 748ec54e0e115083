/*!
 * Reclaim-Daemon Wire Protocol
 *
 * Fixed-width binary frames of native-endian 32-bit integers, each prefixed
 * by a 4-byte opcode. Requests and asynchronous notifications share one
 * channel; a reply carries the opcode of the request it answers.
 */

use crate::core::errors::LowmemdError;
use crate::core::limits::MAX_DAEMON_BUCKETS;
use crate::core::types::{OomScore, Pid, PrincipalId};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Install or replace the priority bucket table
pub const CMD_TARGET: i32 = 0;
/// Set one process's priority
pub const CMD_PROC_PRIORITY: i32 = 1;
/// Stop tracking a process
pub const CMD_PROC_REMOVE: i32 = 2;
/// Forget all tracked processes
pub const CMD_PROC_PURGE: i32 = 3;
/// Query kills performed in a priority range; replied to
pub const CMD_GET_KILL_COUNT: i32 = 4;
/// Ask for asynchronous notifications of an event class
pub const CMD_SUBSCRIBE: i32 = 5;
/// Unsolicited: the daemon killed a process on its own initiative
pub const CMD_PROC_KILLED: i32 = 6;

/// Event class for daemon-initiated kill notifications
pub const ASYNC_EVENT_KILL: i32 = 0;

/// A request frame to the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Up to six (min-free pages, score) pairs, increasing in both fields
    Target(Vec<(u32, OomScore)>),
    ProcPriority {
        pid: Pid,
        principal: PrincipalId,
        score: OomScore,
    },
    ProcRemove(Pid),
    ProcPurge,
    GetKillCount {
        min_score: OomScore,
        max_score: OomScore,
    },
    Subscribe(i32),
}

impl Command {
    /// Opcode the daemon echoes back when this command expects a reply
    #[must_use]
    pub const fn reply_opcode(&self) -> Option<i32> {
        match self {
            Command::GetKillCount { .. } => Some(CMD_GET_KILL_COUNT),
            _ => None,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 * (2 * MAX_DAEMON_BUCKETS + 1));
        match *self {
            Command::Target(ref pairs) => {
                debug_assert!(pairs.len() <= MAX_DAEMON_BUCKETS);
                buf.put_i32_ne(CMD_TARGET);
                for &(pages, score) in pairs.iter().take(MAX_DAEMON_BUCKETS) {
                    buf.put_i32_ne(pages as i32);
                    buf.put_i32_ne(score);
                }
            }
            Command::ProcPriority {
                pid,
                principal,
                score,
            } => {
                buf.put_i32_ne(CMD_PROC_PRIORITY);
                buf.put_i32_ne(pid);
                buf.put_i32_ne(principal as i32);
                buf.put_i32_ne(score);
            }
            Command::ProcRemove(pid) => {
                buf.put_i32_ne(CMD_PROC_REMOVE);
                buf.put_i32_ne(pid);
            }
            Command::ProcPurge => {
                buf.put_i32_ne(CMD_PROC_PURGE);
            }
            Command::GetKillCount {
                min_score,
                max_score,
            } => {
                buf.put_i32_ne(CMD_GET_KILL_COUNT);
                buf.put_i32_ne(min_score);
                buf.put_i32_ne(max_score);
            }
            Command::Subscribe(event) => {
                buf.put_i32_ne(CMD_SUBSCRIBE);
                buf.put_i32_ne(event);
            }
        }
        buf.freeze()
    }
}

/// An unsolicited frame from the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    ProcKilled { pid: Pid, principal: PrincipalId },
}

/// Opcode of a received frame, if it is at least one word long
#[must_use]
pub fn frame_opcode(frame: &[u8]) -> Option<i32> {
    if frame.len() < 4 {
        return None;
    }
    let mut cursor = frame;
    Some(cursor.get_i32_ne())
}

/// Decode an unsolicited notification; `None` for anything unrecognized
#[must_use]
pub fn decode_notification(frame: &[u8]) -> Option<Notification> {
    match frame_opcode(frame)? {
        CMD_PROC_KILLED if frame.len() == 12 => {
            let mut cursor = &frame[4..];
            let pid = cursor.get_i32_ne();
            let principal = cursor.get_i32_ne() as PrincipalId;
            Some(Notification::ProcKilled { pid, principal })
        }
        _ => None,
    }
}

/// Decode the count out of a GET_KILL_COUNT reply
pub fn decode_kill_count_reply(frame: &[u8]) -> Result<u32, LowmemdError> {
    if frame.len() < 8 {
        return Err(LowmemdError::ShortFrame(frame.len()));
    }
    let mut cursor = frame;
    let opcode = cursor.get_i32_ne();
    if opcode != CMD_GET_KILL_COUNT {
        return Err(LowmemdError::ReplyMismatch {
            expected: CMD_GET_KILL_COUNT,
            got: opcode,
        });
    }
    Ok(cursor.get_i32_ne() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn words(frame: &[u8]) -> Vec<i32> {
        frame
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn target_encodes_pairs_in_order() {
        let cmd = Command::Target(vec![(3072, 0), (4608, 100), (6144, 200)]);
        let frame = cmd.encode();
        assert_eq!(words(&frame), vec![CMD_TARGET, 3072, 0, 4608, 100, 6144, 200]);
    }

    #[test]
    fn proc_priority_layout() {
        let cmd = Command::ProcPriority {
            pid: 1234,
            principal: 10_077,
            score: 900,
        };
        assert_eq!(words(&cmd.encode()), vec![CMD_PROC_PRIORITY, 1234, 10_077, 900]);
    }

    #[test]
    fn purge_is_a_bare_opcode() {
        assert_eq!(words(&Command::ProcPurge.encode()), vec![CMD_PROC_PURGE]);
    }

    #[test]
    fn only_kill_count_expects_a_reply() {
        assert_eq!(
            Command::GetKillCount {
                min_score: 0,
                max_score: 999
            }
            .reply_opcode(),
            Some(CMD_GET_KILL_COUNT)
        );
        assert_eq!(Command::ProcPurge.reply_opcode(), None);
        assert_eq!(Command::ProcRemove(1).reply_opcode(), None);
    }

    #[test]
    fn kill_notification_decodes() {
        let mut buf = BytesMut::new();
        buf.put_i32_ne(CMD_PROC_KILLED);
        buf.put_i32_ne(4321);
        buf.put_i32_ne(10_001);
        assert_eq!(
            decode_notification(&buf),
            Some(Notification::ProcKilled {
                pid: 4321,
                principal: 10_001
            })
        );
    }

    #[test]
    fn truncated_kill_notification_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i32_ne(CMD_PROC_KILLED);
        buf.put_i32_ne(4321);
        assert_eq!(decode_notification(&buf), None);
    }

    #[test]
    fn kill_count_reply_round_trip() {
        let mut buf = BytesMut::new();
        buf.put_i32_ne(CMD_GET_KILL_COUNT);
        buf.put_i32_ne(17);
        assert_eq!(decode_kill_count_reply(&buf).unwrap(), 17);

        let mut wrong = BytesMut::new();
        wrong.put_i32_ne(CMD_TARGET);
        wrong.put_i32_ne(17);
        assert!(matches!(
            decode_kill_count_reply(&wrong),
            Err(LowmemdError::ReplyMismatch { .. })
        ));
    }
}
