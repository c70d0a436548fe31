//! Minimal pkt-line framing for the git smart-HTTP v1 protocol.

/// Flush packet.
pub const FLUSH: &str = "0000";

/// Encode one pkt-line: four hex length digits covering themselves plus the
/// payload.
pub fn encode(payload: &str) -> String {
    format!("{:04x}{payload}", payload.len() + 4)
}

/// A ref update carried by a receive-pack request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub old_sha: String,
    pub new_sha: String,
    pub git_ref: String,
}

/// Parse the command section of a receive-pack request body: pkt-lines of
/// `old-sha new-sha refname` (the first line carries a NUL-separated
/// capability list) up to the flush packet. The pack data after the flush
/// is ignored here.
pub fn parse_ref_updates(body: &[u8]) -> Vec<RefUpdate> {
    let mut updates = Vec::new();
    let mut offset = 0usize;

    while offset + 4 <= body.len() {
        let len_hex = match std::str::from_utf8(&body[offset..offset + 4]) {
            Ok(s) => s,
            Err(_) => break,
        };
        let len = match usize::from_str_radix(len_hex, 16) {
            Ok(len) => len,
            Err(_) => break,
        };
        if len == 0 {
            break; // flush-pkt: command section over
        }
        if len < 4 || offset + len > body.len() {
            break;
        }
        let payload = &body[offset + 4..offset + len];
        offset += len;

        let line = String::from_utf8_lossy(payload);
        // Capabilities trail the first line after a NUL.
        let line = line.split('\0').next().unwrap_or("").trim_end_matches('\n');
        let mut parts = line.splitn(3, ' ');
        let (Some(old_sha), Some(new_sha), Some(git_ref)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if old_sha.len() != 40 || new_sha.len() != 40 || git_ref.is_empty() {
            continue;
        }
        updates.push(RefUpdate {
            old_sha: old_sha.to_string(),
            new_sha: new_sha.to_string(),
            git_ref: git_ref.to_string(),
        });
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(payload: &str) -> Vec<u8> {
        encode(payload).into_bytes()
    }

    #[test]
    fn encode_length_covers_header() {
        assert_eq!(encode("a\n"), "0006a\n");
        assert_eq!(encode("# service=git-upload-pack\n").len(), 4 + 26);
    }

    #[test]
    fn parses_single_update_with_capabilities() {
        let old = "0".repeat(40);
        let new = "a".repeat(40);
        let mut body = pkt(&format!(
            "{old} {new} refs/heads/main\0report-status side-band-64k\n"
        ));
        body.extend_from_slice(FLUSH.as_bytes());
        body.extend_from_slice(b"PACK....");

        let updates = parse_ref_updates(&body);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].old_sha, old);
        assert_eq!(updates[0].new_sha, new);
        assert_eq!(updates[0].git_ref, "refs/heads/main");
    }

    #[test]
    fn parses_multiple_updates() {
        let old = "1".repeat(40);
        let new = "2".repeat(40);
        let mut body = pkt(&format!("{old} {new} refs/heads/main\0report-status\n"));
        body.extend(pkt(&format!("{old} {new} refs/heads/dev\n")));
        body.extend_from_slice(FLUSH.as_bytes());

        let updates = parse_ref_updates(&body);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].git_ref, "refs/heads/dev");
    }

    #[test]
    fn stops_at_flush_before_pack_data() {
        let old = "3".repeat(40);
        let new = "4".repeat(40);
        let mut body = pkt(&format!("{old} {new} refs/heads/main\n"));
        body.extend_from_slice(FLUSH.as_bytes());
        // Pack data that happens to look length-prefixed must not parse.
        body.extend(pkt(&format!("{old} {new} refs/heads/ghost\n")));

        let updates = parse_ref_updates(&body);
        assert_eq!(updates.len(), 1);
    }

    #[test]
    fn garbage_is_not_an_update() {
        assert!(parse_ref_updates(b"not a pktline").is_empty());
        assert!(parse_ref_updates(&pkt("short line\n")).is_empty());
    }
}
