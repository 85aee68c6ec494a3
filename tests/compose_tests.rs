//! Properties of message composition and streaming, checked exhaustively over small inputs

use std::io::Read;

use tokenmail::{DotStuffer, MessageCursor, MessageFields, compose, sanitize_crlf};

/// Every string of length up to `max_len` over a line-ending heavy alphabet
fn all_strings(max_len: usize) -> Vec<String> {
    const ALPHABET: [char; 4] = ['a', '.', '\r', '\n'];
    let mut out = vec![String::new()];
    let mut frontier = vec![String::new()];
    for _ in 0..max_len {
        let mut next = Vec::new();
        for prefix in &frontier {
            for c in ALPHABET {
                let mut s = prefix.clone();
                s.push(c);
                next.push(s);
            }
        }
        out.extend(next.iter().cloned());
        frontier = next;
    }
    out
}

fn has_bare_lf(s: &str) -> bool {
    let bytes = s.as_bytes();
    (0..bytes.len()).any(|i| bytes[i] == b'\n' && (i == 0 || bytes[i - 1] != b'\r'))
}

#[test]
fn test_sanitize_is_idempotent() {
    for input in all_strings(6) {
        let once = sanitize_crlf(&input);
        assert_eq!(sanitize_crlf(&once), once, "input {input:?}");
    }
}

#[test]
fn test_sanitize_leaves_no_bare_lf() {
    for input in all_strings(6) {
        let out = sanitize_crlf(&input);
        assert!(!has_bare_lf(&out), "input {input:?} gave {out:?}");

        // Only CRs are inserted, and only in front of an LF
        let inserted = out.len() - input.len();
        assert_eq!(inserted, input.matches('\n').count() - input.matches("\r\n").count());
        assert_eq!(out.replace("\r\n", "\n"), input.replace("\r\n", "\n"));
    }
}

#[test]
fn test_composed_length_matches_buffer() {
    for body in all_strings(4) {
        for subject in ["", "Hi", "a\nb"] {
            let message = compose("a@x.com", "b@x.com", subject, &body);
            assert_eq!(message.len(), message.as_bytes().len());
            assert!(!message.is_empty());
            assert!(!has_bare_lf(std::str::from_utf8(message.as_bytes()).unwrap()));
        }
    }
}

#[test]
fn test_cursor_hands_out_every_byte_once() {
    let message = MessageFields::new(
        "a@x.com",
        "b@x.com",
        "Streaming",
        &"<p>paragraph</p>\n".repeat(40),
    )
    .compose();

    for chunk_size in 1..=message.len() + 1 {
        let mut cursor = MessageCursor::new(&message);
        let mut total = 0;
        let mut collected = Vec::with_capacity(message.len());
        while let Some(chunk) = cursor.next_chunk(chunk_size) {
            total += chunk.len();
            collected.extend_from_slice(chunk);
        }
        assert_eq!(total, message.len());
        assert_eq!(collected, message.as_bytes());
        assert_eq!(cursor.next_chunk(chunk_size), None);
    }
}

#[test]
fn test_cursor_as_reader() {
    let message = compose("a@x.com", "b@x.com", "Reader", "<p>body</p>");
    for buf_size in [1, 5, 64, 4096] {
        let mut cursor = MessageCursor::new(&message);
        let mut buf = vec![0u8; buf_size];
        let mut collected = Vec::new();
        loop {
            let n = cursor.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, message.as_bytes());
    }
}

#[test]
fn test_dot_stuffing_is_reversible() {
    for body in all_strings(5) {
        let message = compose("a@x.com", "b@x.com", "", &body);
        for chunk_size in [1, 3, 1000] {
            let mut wire = Vec::new();
            let mut stuffer = DotStuffer::new();
            let mut cursor = MessageCursor::new(&message);
            while let Some(chunk) = cursor.next_chunk(chunk_size) {
                stuffer.write_chunk(chunk, &mut wire).unwrap();
            }
            assert_eq!(stuffer.consumed(), message.len());
            stuffer.finish(&mut wire).unwrap();

            // Receiver side: drop the terminator and undo the stuffing
            let wire = String::from_utf8(wire).unwrap();
            let data = wire.strip_suffix(".\r\n").unwrap();
            let unstuffed: Vec<&str> = data
                .split("\r\n")
                .map(|line| line.strip_prefix('.').unwrap_or(line))
                .collect();
            let mut expected = String::from_utf8(message.as_bytes().to_vec()).unwrap();
            if !expected.ends_with("\r\n") {
                expected.push_str("\r\n");
            }
            assert_eq!(unstuffed.join("\r\n"), expected, "body {body:?}");
        }
    }
}
