//! Building the authorized-key set for the embedded server.
//!
//! Keys arrive as OpenSSH `authorized_keys`-format blobs, one source at
//! a time (files on disk here; provider-hosted keys are fetched by the
//! CLI layer and handed in as bytes).  A source that yields zero keys
//! is a configuration error: the user asked to restrict access to it.
//! An empty overall set, by contrast, means the session is open to any
//! authenticated client.

use std::path::Path;

use anyhow::{bail, Context};
use ssh_key::{HashAlg, PublicKey};

use crate::api::AuthorizedKey;

/// Parse one `authorized_keys`-format blob into an [`AuthorizedKey`]
/// carrying its keys and SHA256 fingerprints.
pub fn parse_authorized_keys(input: &str, comment: &str) -> anyhow::Result<AuthorizedKey> {
    let mut keys = Vec::new();
    for (line_no, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let key = PublicKey::from_openssh(strip_key_options(line))
            .with_context(|| format!("{comment}:{} is not a public key", line_no + 1))?;
        keys.push(key);
    }
    if keys.is_empty() {
        bail!("no authorized keys found in {comment}");
    }
    let fingerprints = keys
        .iter()
        .map(|key| key.fingerprint(HashAlg::Sha256).to_string())
        .collect();
    Ok(AuthorizedKey {
        comment: comment.to_string(),
        fingerprints,
        keys,
    })
}

/// Per sshd(8), a line may lead with a comma-separated options field
/// (`command="...",no-pty ssh-ed25519 AAAA...`).  Drop it so the rest
/// parses as a bare key.  Option values are quoted strings where `"`
/// can be backslash-escaped, so the split happens at the first space
/// outside quotes.
fn strip_key_options(line: &str) -> &str {
    if starts_with_key_type(line) {
        return line;
    }
    let mut in_quotes = false;
    let mut escaped = false;
    for (idx, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ' ' | '\t' if !in_quotes => return line[idx..].trim_start(),
            _ => {}
        }
    }
    line
}

fn starts_with_key_type(line: &str) -> bool {
    ["ssh-", "ecdsa-", "sk-"]
        .iter()
        .any(|prefix| line.starts_with(prefix))
}

/// Load one source per file path.
pub fn load_authorized_key_files(paths: &[impl AsRef<Path>]) -> anyhow::Result<Vec<AuthorizedKey>> {
    let mut sources = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading authorized keys from {}", path.display()))?;
        sources.push(parse_authorized_keys(&contents, &path.display().to_string())?);
    }
    Ok(sources)
}

/// Flatten the sources into the raw key list the server compares
/// presented keys against.
pub fn flatten(sources: &[AuthorizedKey]) -> Vec<PublicKey> {
    sources
        .iter()
        .flat_map(|source| source.keys.iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ED25519: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEB alice@example";

    #[test]
    fn parses_keys_and_fingerprints() {
        let input = format!("# a comment\n\n{ED25519}\n");
        let source = parse_authorized_keys(&input, "test-source").unwrap();
        k9::assert_equal!(source.keys.len(), 1);
        k9::assert_equal!(source.fingerprints.len(), 1);
        assert!(source.fingerprints[0].starts_with("SHA256:"));
        // ssh-key renders fingerprints without base64 padding.
        assert!(!source.fingerprints[0].ends_with('='));
    }

    #[test]
    fn options_prefixed_line_parses() {
        let input = format!(
            "command=\"echo \\\"ssh-rsa is not here\\\", bye\",no-port-forwarding,no-pty {ED25519}\n"
        );
        let source = parse_authorized_keys(&input, "restricted").unwrap();
        k9::assert_equal!(source.keys.len(), 1);

        let bare = parse_authorized_keys(ED25519, "bare").unwrap();
        k9::assert_equal!(source.fingerprints, bare.fingerprints);
    }

    #[test]
    fn zero_keys_from_a_requested_source_is_an_error() {
        assert!(parse_authorized_keys("# nothing here\n", "empty-source").is_err());
    }

    #[test]
    fn garbage_line_is_an_error() {
        assert!(parse_authorized_keys("not a key at all\n", "bad").is_err());
    }

    #[test]
    fn flatten_collects_all_sources() {
        let a = parse_authorized_keys(ED25519, "a").unwrap();
        let b = parse_authorized_keys(ED25519, "b").unwrap();
        k9::assert_equal!(flatten(&[a, b]).len(), 2);
    }
}
