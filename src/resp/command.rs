//! Incremental decoding of pipelined RESP command frames.
//!
//! Ref: <https://redis.io/docs/reference/protocol-spec>

use bytes::Bytes;
use thiserror::Error as ThisError;

use crate::pool::IntPool;

/// Upper bound on arguments in one multi-bulk command.
const MAX_MULTIBULK_ARGS: usize = 1024 * 1024;
/// Upper bound on one bulk payload, matching the Redis limit.
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
/// Upper bound on one inline command line.
const MAX_INLINE_LEN: usize = 64 * 1024;

#[derive(Clone, Debug, ThisError, PartialEq, Eq)]
pub enum ParseError {
    #[error("Protocol error: invalid multibulk length")]
    InvalidMultibulkLength,
    #[error("Protocol error: invalid bulk length")]
    InvalidBulkLength,
    #[error("Protocol error: expected '$', got '{0}'")]
    ExpectedBulk(char),
    #[error("Protocol error: too big inline request")]
    InlineTooLong,
}

/// A single client command: ordered argument byte-strings, the first of
/// which is conventionally the command name. Arguments are zero-copy views
/// into the parse buffer of one traffic event; handlers must copy anything
/// they retain past the current invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub args: Vec<Bytes>,
}

impl Command {
    /// The command name (first argument); empty for a command with no args,
    /// which the parser never produces.
    pub fn name(&self) -> &[u8] {
        self.args.first().map(|a| a.as_ref()).unwrap_or(b"")
    }
}

enum Parsed {
    /// Frame consumed up to `next`; argument spans start at index `args_at`
    /// of the IntPool.
    Complete { next: usize, args_at: usize },
    /// Not enough bytes for a whole frame.
    Partial,
}

/// Parses every complete command frame out of `input`.
///
/// Returns the parsed commands and the unconsumed suffix, which begins at
/// the first byte of a trailing incomplete frame and is empty when the
/// input ended on a frame boundary. Argument offset/length pairs are
/// recorded in `ip` and materialized as `Bytes` views into `input` without
/// copying payloads; the caller resets `ip` after each call.
///
/// A [`ParseError`] invalidates the whole input: the caller is expected to
/// discard its accumulated bytes and report the error to the client.
pub fn read_commands(ip: &mut IntPool, input: Bytes) -> Result<(Vec<Command>, Bytes), ParseError> {
    let buf = &input[..];
    let mut commands = Vec::new();
    let mut pos = 0;

    while pos < buf.len() {
        let frame_start = pos;
        let parsed = if buf[pos] == b'*' {
            parse_multibulk(ip, buf, pos)?
        } else {
            parse_inline(ip, buf, pos)?
        };

        match parsed {
            Parsed::Complete { next, args_at } => {
                let spans = &ip.as_slice()[args_at..];
                if !spans.is_empty() {
                    let args = spans
                        .chunks_exact(2)
                        .map(|span| input.slice(span[0]..span[0] + span[1]))
                        .collect();
                    commands.push(Command { args });
                }
                pos = next;
            }
            Parsed::Partial => {
                return Ok((commands, input.slice(frame_start..)));
            }
        }
    }

    Ok((commands, Bytes::new()))
}

/// `*N\r\n` followed by N bulk arguments, each `$L\r\n<payload>\r\n`.
fn parse_multibulk(ip: &mut IntPool, buf: &[u8], start: usize) -> Result<Parsed, ParseError> {
    let args_at = ip.len();

    let Some(count_line) = read_line(buf, start + 1) else {
        return Ok(Parsed::Partial);
    };
    let count = parse_length(count_line.bytes, MAX_MULTIBULK_ARGS)
        .ok_or(ParseError::InvalidMultibulkLength)?;
    let mut pos = count_line.next;

    for _ in 0..count {
        if pos >= buf.len() {
            return Ok(Parsed::Partial);
        }
        if buf[pos] != b'$' {
            return Err(ParseError::ExpectedBulk(buf[pos] as char));
        }
        let Some(len_line) = read_line(buf, pos + 1) else {
            return Ok(Parsed::Partial);
        };
        let len =
            parse_length(len_line.bytes, MAX_BULK_LEN).ok_or(ParseError::InvalidBulkLength)?;
        pos = len_line.next;

        if pos + len + 2 > buf.len() {
            return Ok(Parsed::Partial);
        }
        if buf[pos + len] != b'\r' || buf[pos + len + 1] != b'\n' {
            return Err(ParseError::InvalidBulkLength);
        }
        ip.push(pos);
        ip.push(len);
        pos += len + 2;
    }

    Ok(Parsed::Complete { next: pos, args_at })
}

/// A single line of ASCII-whitespace-separated arguments, terminated by
/// `\r\n` or a bare `\n`.
fn parse_inline(ip: &mut IntPool, buf: &[u8], start: usize) -> Result<Parsed, ParseError> {
    let args_at = ip.len();

    let Some(newline) = buf[start..].iter().position(|&b| b == b'\n') else {
        if buf.len() - start > MAX_INLINE_LEN {
            return Err(ParseError::InlineTooLong);
        }
        return Ok(Parsed::Partial);
    };
    let next = start + newline + 1;
    let mut line_end = start + newline;
    if line_end > start && buf[line_end - 1] == b'\r' {
        line_end -= 1;
    }
    if line_end - start > MAX_INLINE_LEN {
        return Err(ParseError::InlineTooLong);
    }

    let mut i = start;
    while i < line_end {
        if buf[i].is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let token = i;
        while i < line_end && !buf[i].is_ascii_whitespace() {
            i += 1;
        }
        ip.push(token);
        ip.push(i - token);
    }

    Ok(Parsed::Complete { next, args_at })
}

struct Line<'a> {
    bytes: &'a [u8],
    next: usize,
}

/// Reads a `\r\n`-terminated header line beginning at `start`. Returns
/// `None` when the terminator has not arrived yet.
fn read_line(buf: &[u8], start: usize) -> Option<Line<'_>> {
    let newline = buf[start..].iter().position(|&b| b == b'\n')?;
    let end = start + newline;
    Some(Line {
        // an empty or \r-less line fails the digit check downstream
        bytes: buf[start..end].strip_suffix(b"\r").unwrap_or(&[]),
        next: end + 1,
    })
}

/// Parses a non-negative decimal no larger than `max`. Any other content,
/// including a sign, is rejected.
fn parse_length(line: &[u8], max: usize) -> Option<usize> {
    if line.is_empty() {
        return None;
    }
    let mut n: usize = 0;
    for &b in line {
        if !b.is_ascii_digit() {
            return None;
        }
        n = n * 10 + (b - b'0') as usize;
        if n > max {
            return None;
        }
    }
    Some(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &[u8]) -> Result<(Vec<Command>, Bytes), ParseError> {
        let mut ip = IntPool::new();
        read_commands(&mut ip, Bytes::copy_from_slice(input))
    }

    fn args(cmd: &Command) -> Vec<&[u8]> {
        cmd.args.iter().map(|a| a.as_ref()).collect()
    }

    #[test]
    fn parse_single_multibulk_command() {
        let (cmds, rest) = parse(b"*1\r\n$4\r\nPING\r\n").unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(args(&cmds[0]), vec![b"PING".as_ref()]);
        assert!(rest.is_empty());
    }

    #[test]
    fn parse_pipelined_commands_in_order() {
        let (cmds, rest) =
            parse(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n")
                .unwrap();
        assert_eq!(cmds.len(), 2);
        assert_eq!(args(&cmds[0]), vec![b"SET".as_ref(), b"k", b"v"]);
        assert_eq!(args(&cmds[1]), vec![b"GET".as_ref(), b"k"]);
        assert!(rest.is_empty());
    }

    #[test]
    fn parse_binary_safe_payload() {
        let (cmds, _) = parse(b"*2\r\n$3\r\nSET\r\n$4\r\na\r\nb\r\n").unwrap();
        assert_eq!(args(&cmds[0]), vec![b"SET".as_ref(), b"a\r\nb"]);
    }

    #[test]
    fn parse_inline_command() {
        let (cmds, rest) = parse(b"PING\r\n").unwrap();
        assert_eq!(args(&cmds[0]), vec![b"PING".as_ref()]);
        assert!(rest.is_empty());
    }

    #[test]
    fn parse_inline_splits_on_whitespace() {
        let (cmds, _) = parse(b"SET  key\t value\r\n").unwrap();
        assert_eq!(args(&cmds[0]), vec![b"SET".as_ref(), b"key", b"value"]);
    }

    #[test]
    fn parse_inline_accepts_bare_newline() {
        let (cmds, _) = parse(b"PING\n").unwrap();
        assert_eq!(args(&cmds[0]), vec![b"PING".as_ref()]);
    }

    #[test]
    fn blank_inline_line_produces_no_command() {
        let (cmds, rest) = parse(b"\r\nPING\r\n").unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(args(&cmds[0]), vec![b"PING".as_ref()]);
        assert!(rest.is_empty());
    }

    #[test]
    fn empty_multibulk_produces_no_command() {
        let (cmds, rest) = parse(b"*0\r\n*1\r\n$4\r\nPING\r\n").unwrap();
        assert_eq!(cmds.len(), 1);
        assert!(rest.is_empty());
    }

    #[test]
    fn partial_frame_is_returned_as_remainder() {
        let (cmds, rest) = parse(b"*2\r\n$3\r\nGET\r\n$1\r\n").unwrap();
        assert!(cmds.is_empty());
        assert_eq!(&rest[..], b"*2\r\n$3\r\nGET\r\n$1\r\n");
    }

    #[test]
    fn complete_commands_before_partial_are_kept() {
        let (cmds, rest) = parse(b"*1\r\n$4\r\nPING\r\n*2\r\n$3\r\nGET\r\n$1").unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(&rest[..], b"*2\r\n$3\r\nGET\r\n$1");
    }

    #[test]
    fn partial_inline_line_is_returned_as_remainder() {
        let (cmds, rest) = parse(b"GET fo").unwrap();
        assert!(cmds.is_empty());
        assert_eq!(&rest[..], b"GET fo");
    }

    #[test]
    fn missing_bulk_terminator_is_a_partial() {
        // payload present but the closing CRLF has not arrived
        let (cmds, rest) = parse(b"*1\r\n$4\r\nPING").unwrap();
        assert!(cmds.is_empty());
        assert_eq!(&rest[..], b"*1\r\n$4\r\nPING");
    }

    #[test]
    fn non_digit_count_is_an_error() {
        assert_eq!(parse(b"*x\r\n"), Err(ParseError::InvalidMultibulkLength));
        assert_eq!(parse(b"*-1\r\n"), Err(ParseError::InvalidMultibulkLength));
    }

    #[test]
    fn non_digit_bulk_length_is_an_error() {
        assert_eq!(parse(b"*2\r\n$X\r\n"), Err(ParseError::InvalidBulkLength));
        assert_eq!(
            parse(b"*1\r\n$-1\r\n"),
            Err(ParseError::InvalidBulkLength)
        );
    }

    #[test]
    fn oversized_count_is_an_error() {
        assert_eq!(
            parse(b"*99999999999\r\n"),
            Err(ParseError::InvalidMultibulkLength)
        );
    }

    #[test]
    fn wrong_argument_header_is_an_error() {
        assert_eq!(
            parse(b"*1\r\n:5\r\n"),
            Err(ParseError::ExpectedBulk(':'))
        );
    }

    #[test]
    fn corrupt_bulk_terminator_is_an_error() {
        assert_eq!(
            parse(b"*1\r\n$4\r\nPINGxx"),
            Err(ParseError::InvalidBulkLength)
        );
    }

    #[test]
    fn any_partition_of_a_stream_yields_the_same_commands() {
        let stream: &[u8] =
            b"*1\r\n$4\r\nPING\r\n*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\nGET foo\r\n";

        for split in 0..=stream.len() {
            let mut ip = IntPool::new();
            let mut acc: Vec<u8> = Vec::new();
            let mut all = Vec::new();

            for part in [&stream[..split], &stream[split..]] {
                acc.extend_from_slice(part);
                let (cmds, rest) = read_commands(&mut ip, Bytes::copy_from_slice(&acc)).unwrap();
                ip.reset();
                all.extend(cmds);
                acc = rest.to_vec();
            }

            assert!(acc.is_empty(), "split at {split} left bytes behind");
            assert_eq!(all.len(), 3, "split at {split}");
            assert_eq!(args(&all[0]), vec![b"PING".as_ref()]);
            assert_eq!(args(&all[1]), vec![b"SET".as_ref(), b"foo", b"bar"]);
            assert_eq!(args(&all[2]), vec![b"GET".as_ref(), b"foo"]);
        }
    }

    #[test]
    fn mixed_inline_and_multibulk_stream() {
        let (cmds, rest) = parse(b"PING\r\n*1\r\n$4\r\nPING\r\nGET k\r\n").unwrap();
        assert_eq!(cmds.len(), 3);
        assert!(rest.is_empty());
    }
}
