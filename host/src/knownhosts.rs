//! OpenSSH-compatible known_hosts verification for the rendezvous
//! connection.
//!
//! Two policies are provided.  `PromptingVerifier` reproduces the
//! interactive OpenSSH first-contact flow; `AcceptNewVerifier` behaves
//! like `StrictHostKeyChecking=accept-new`.  Both share the same store:
//! an append-only OpenSSH-format file.  Appended entries always carry
//! the hostname (bracketed with the port when non-default) and never
//! the remote IP address, so rendezvous backends can move between
//! addresses without retriggering verification.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context;
use ssh_key::{Algorithm, Certificate, HashAlg, PublicKey};

/// The key a server presented during the handshake.  Servers fronted by
/// a certificate authority present a certificate; the store records the
/// CA key with the `@cert-authority` marker rather than the signed
/// envelope.
#[derive(Debug, Clone)]
pub enum ServerKey {
    Plain(PublicKey),
    Cert(Certificate),
}

impl ServerKey {
    /// Classify the key material the SSH transport handed us.  A host
    /// fronted by a certificate authority shows up as a public key
    /// whose algorithm is the `*-cert-v01@openssh.com` form; re-parse
    /// those as certificates so the cert-authority comparison applies.
    pub fn from_public_key(key: &PublicKey) -> ServerKey {
        if key.algorithm().as_str().ends_with("-cert-v01@openssh.com") {
            match key
                .to_openssh()
                .and_then(|encoded| Certificate::from_openssh(&encoded))
            {
                Ok(cert) => return ServerKey::Cert(cert),
                Err(err) => {
                    log::debug!("host key looks like a certificate but did not parse: {err}");
                }
            }
        }
        ServerKey::Plain(key.clone())
    }

    /// The key that gets compared and persisted: the key itself, or the
    /// certificate's signature key.
    pub fn stored_key(&self) -> PublicKey {
        match self {
            ServerKey::Plain(key) => key.clone(),
            ServerKey::Cert(cert) => PublicKey::new(cert.signature_key().clone(), ""),
        }
    }

    pub fn is_cert(&self) -> bool {
        matches!(self, ServerKey::Cert(_))
    }

    pub fn fingerprint(&self) -> String {
        self.stored_key().fingerprint(HashAlg::Sha256).to_string()
    }

    /// Key type the way OpenSSH prints it in prompts, e.g. `ED25519`.
    pub fn type_label(&self) -> String {
        match self.stored_key().algorithm() {
            Algorithm::Ed25519 => "ED25519".into(),
            Algorithm::Rsa { .. } => "RSA".into(),
            Algorithm::Ecdsa { .. } => "ECDSA".into(),
            Algorithm::Dsa => "DSA".into(),
            other => other.as_str().to_uppercase(),
        }
    }
}

/// Marker for lines recording a certificate authority.
const CERT_AUTHORITY_MARKER: &str = "@cert-authority";

/// The hostname field written to and matched against the store:
/// `host` for the default port, `[host]:port` otherwise.
pub fn host_pattern(hostname: &str, port: u16) -> String {
    if port == 22 {
        hostname.to_string()
    } else {
        format!("[{hostname}]:{port}")
    }
}

#[derive(Debug)]
enum Lookup {
    /// A matching line vouches for the presented key.
    Trusted,
    /// The host appears with a different key.
    Mismatch { line_no: usize },
    /// The host has never been seen.
    Unknown,
}

/// How the user (or a test harness) is asked about unknown hosts.  The
/// file append and the interactive read are deliberately separate
/// capabilities so the prompting flow is testable without a tty.
pub trait Interaction: Send + Sync {
    fn write_line(&self, line: &str) -> std::io::Result<()>;
    /// Prompt without a trailing newline and read one line of input.
    fn prompt(&self, prompt: &str) -> std::io::Result<String>;
}

/// Console-backed interaction; prompts go to stderr so they never mix
/// into the session stream on stdout.
pub struct StdioInteraction;

impl Interaction for StdioInteraction {
    fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut err = std::io::stderr().lock();
        writeln!(err, "{line}")
    }

    fn prompt(&self, prompt: &str) -> std::io::Result<String> {
        {
            let mut err = std::io::stderr().lock();
            write!(err, "{prompt}")?;
            err.flush()?;
        }
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KnownHostsError {
    #[error(
        "host key mismatch for {host}: got fingerprint {fingerprint} instead of the \
         expected value from {file}:{line}"
    )]
    Mismatch {
        host: String,
        fingerprint: String,
        file: PathBuf,
        line: usize,
    },
    #[error("host key verification failed: user declined to trust {host}")]
    Declined { host: String },
}

/// The append-only OpenSSH-format store shared by both verifiers.
pub struct KnownHostsStore {
    path: PathBuf,
}

impl KnownHostsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lookup(&self, pattern: &str, key: &ServerKey) -> anyhow::Result<Lookup> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Lookup::Unknown),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()))
            }
        };

        let presented = key.stored_key();
        let want_marker = key.is_cert();
        let mut offending: Option<usize> = None;

        for (idx, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (marker, rest) = match line.strip_prefix('@') {
                Some(_) => {
                    let Some((marker, rest)) = line.split_once(char::is_whitespace) else {
                        continue;
                    };
                    (Some(marker), rest.trim_start())
                }
                None => (None, line),
            };
            // Only @cert-authority lines are meaningful here; revoked
            // and unknown markers are skipped.
            let is_ca = marker == Some(CERT_AUTHORITY_MARKER);
            if marker.is_some() && !is_ca {
                continue;
            }
            if is_ca != want_marker {
                continue;
            }

            let Some((hosts, key_part)) = rest.split_once(char::is_whitespace) else {
                continue;
            };
            if !hosts.split(',').any(|h| pattern_matches(h, pattern)) {
                continue;
            }

            match PublicKey::from_openssh(key_part.trim()) {
                Ok(stored) if stored.key_data() == presented.key_data() => {
                    return Ok(Lookup::Trusted);
                }
                Ok(_) => {
                    offending.get_or_insert(idx + 1);
                }
                Err(err) => {
                    log::debug!(
                        "skipping unparseable known_hosts line {}:{}: {err}",
                        self.path.display(),
                        idx + 1
                    );
                }
            }
        }

        Ok(match offending {
            Some(line_no) => Lookup::Mismatch { line_no },
            None => Lookup::Unknown,
        })
    }

    /// Append an entry for the host.  The file is created 0600 (its
    /// directory 0700) if absent; appends are line-atomic per the
    /// OpenSSH convention, so no locking is taken.
    fn append(&self, pattern: &str, key: &ServerKey) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                create_private_dir(dir)?;
            }
        }

        let stored = key.stored_key();
        let openssh = stored
            .to_openssh()
            .context("encoding host key for known_hosts")?;
        let mut line = String::new();
        if key.is_cert() {
            write!(line, "{CERT_AUTHORITY_MARKER} ").ok();
        }
        writeln!(line, "{pattern} {openssh}").ok();

        let mut options = std::fs::OpenOptions::new();
        options.append(true).create(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("appending to {}", self.path.display()))?;
        Ok(())
    }
}

fn create_private_dir(dir: &Path) -> anyhow::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(dir)
        .with_context(|| format!("creating {}", dir.display()))
}

/// OpenSSH host pattern match: literal (case-insensitive) with `*` and
/// `?` wildcards.  Hashed and negated patterns are treated as
/// non-matching; we never write them.
fn pattern_matches(pattern: &str, host: &str) -> bool {
    if pattern.starts_with('|') || pattern.starts_with('!') {
        return false;
    }
    glob_match(
        pattern.to_ascii_lowercase().as_bytes(),
        host.to_ascii_lowercase().as_bytes(),
    )
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], text)
                || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}

/// The seam the tunnel dials through: asked once per handshake.
pub trait HostKeyVerifier: Send + Sync {
    fn verify(&self, hostname: &str, port: u16, remote: &str, key: &ServerKey)
        -> anyhow::Result<()>;
}

/// Interactive first-contact verification, OpenSSH style.
pub struct PromptingVerifier {
    store: KnownHostsStore,
    interaction: Box<dyn Interaction>,
}

impl PromptingVerifier {
    pub fn new(path: impl Into<PathBuf>, interaction: Box<dyn Interaction>) -> Self {
        Self {
            store: KnownHostsStore::new(path),
            interaction,
        }
    }
}

impl HostKeyVerifier for PromptingVerifier {
    fn verify(
        &self,
        hostname: &str,
        port: u16,
        remote: &str,
        key: &ServerKey,
    ) -> anyhow::Result<()> {
        let pattern = host_pattern(hostname, port);
        match self.store.lookup(&pattern, key)? {
            Lookup::Trusted => Ok(()),
            Lookup::Mismatch { line_no } => {
                print_mismatch_warning(&*self.interaction, key, &self.store.path, line_no);
                Err(KnownHostsError::Mismatch {
                    host: pattern,
                    fingerprint: key.fingerprint(),
                    file: self.store.path.clone(),
                    line: line_no,
                }
                .into())
            }
            Lookup::Unknown => {
                let fingerprint = key.fingerprint();
                self.interaction.write_line(&format!(
                    "The authenticity of host '{pattern} ({remote})' can't be established."
                ))?;
                self.interaction.write_line(&format!(
                    "{} key fingerprint is {fingerprint}.",
                    key.type_label()
                ))?;

                let mut question =
                    "Are you sure you want to continue connecting (yes/no/[fingerprint])? "
                        .to_string();
                loop {
                    let answer = self.interaction.prompt(&question)?;
                    if answer == "yes" || answer == fingerprint {
                        self.store.append(&pattern, key)?;
                        self.interaction.write_line(&format!(
                            "Warning: Permanently added '{pattern}' ({}) to the list of known hosts.",
                            key.type_label()
                        ))?;
                        return Ok(());
                    }
                    if answer == "no" {
                        return Err(KnownHostsError::Declined { host: pattern }.into());
                    }
                    question = "Please type 'yes', 'no' or the fingerprint: ".to_string();
                }
            }
        }
    }
}

/// `StrictHostKeyChecking=accept-new`: trust and record first contact,
/// fail loudly on a changed key.
pub struct AcceptNewVerifier {
    store: KnownHostsStore,
    interaction: Box<dyn Interaction>,
}

impl AcceptNewVerifier {
    pub fn new(path: impl Into<PathBuf>, interaction: Box<dyn Interaction>) -> Self {
        Self {
            store: KnownHostsStore::new(path),
            interaction,
        }
    }
}

impl HostKeyVerifier for AcceptNewVerifier {
    fn verify(
        &self,
        hostname: &str,
        port: u16,
        _remote: &str,
        key: &ServerKey,
    ) -> anyhow::Result<()> {
        let pattern = host_pattern(hostname, port);
        match self.store.lookup(&pattern, key)? {
            Lookup::Trusted => Ok(()),
            Lookup::Unknown => {
                self.store.append(&pattern, key)?;
                self.interaction.write_line(&format!(
                    "Warning: Permanently added '{pattern}' ({}) to the list of known hosts.",
                    key.type_label()
                ))?;
                Ok(())
            }
            Lookup::Mismatch { line_no } => {
                print_mismatch_warning(&*self.interaction, key, &self.store.path, line_no);
                Err(KnownHostsError::Mismatch {
                    host: pattern,
                    fingerprint: key.fingerprint(),
                    file: self.store.path.clone(),
                    line: line_no,
                }
                .into())
            }
        }
    }
}

fn print_mismatch_warning(
    interaction: &dyn Interaction,
    key: &ServerKey,
    file: &Path,
    line_no: usize,
) {
    let label = key.type_label();
    let fingerprint = key.fingerprint();
    let lines = [
        "@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@".to_string(),
        "@    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @".to_string(),
        "@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@".to_string(),
        "IT IS POSSIBLE THAT SOMEONE IS DOING SOMETHING NASTY!".to_string(),
        "Someone could be eavesdropping on you right now (man-in-the-middle attack)!".to_string(),
        "It is also possible that a host key has just been changed.".to_string(),
        format!("The fingerprint for the {label} key sent by the remote host is\n{fingerprint}."),
        "Please contact your system administrator.".to_string(),
        format!(
            "Add correct host key in {} to get rid of this message.",
            file.display()
        ),
        format!("Offending {label} key in {}:{line_no}", file.display()),
    ];
    for line in lines {
        if interaction.write_line(&line).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    const KEY_A: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEB";
    const KEY_B: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgIC";

    fn server_key(openssh: &str) -> ServerKey {
        ServerKey::Plain(PublicKey::from_openssh(openssh).unwrap())
    }

    /// Scripted interaction: canned answers in, transcript out.
    #[derive(Default)]
    struct Script {
        answers: Mutex<VecDeque<String>>,
        transcript: Mutex<Vec<String>>,
    }

    impl Script {
        fn answering(answers: &[&str]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().map(|s| s.to_string()).collect()),
                transcript: Mutex::new(Vec::new()),
            }
        }
    }

    impl Interaction for &Script {
        fn write_line(&self, line: &str) -> std::io::Result<()> {
            self.transcript.lock().push(line.to_string());
            Ok(())
        }

        fn prompt(&self, prompt: &str) -> std::io::Result<String> {
            self.transcript.lock().push(prompt.to_string());
            Ok(self.answers.lock().pop_front().unwrap_or_default())
        }
    }

    fn leak(script: Script) -> &'static Script {
        Box::leak(Box::new(script))
    }

    #[test]
    fn first_contact_yes_appends_hostname_not_ip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let script = leak(Script::answering(&["yes"]));
        let verifier = PromptingVerifier::new(&path, Box::new(script));

        verifier
            .verify("uptermd.example", 443, "[2a09::1]:443", &server_key(KEY_A))
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        k9::assert_equal!(lines.len(), 1);
        assert!(lines[0].starts_with("[uptermd.example]:443 ssh-ed25519 "));
        assert!(!contents.contains("2a09::1"));
    }

    #[test]
    fn default_port_is_unbracketed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let script = leak(Script::answering(&["yes"]));
        let verifier = PromptingVerifier::new(&path, Box::new(script));
        verifier
            .verify("uptermd.example", 22, "198.51.100.4:22", &server_key(KEY_A))
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("uptermd.example ssh-ed25519 "));
    }

    #[test]
    fn fingerprint_answer_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let key = server_key(KEY_A);
        let fingerprint = key.fingerprint();
        let script = leak(Script::answering(&[fingerprint.as_str()]));
        let verifier = PromptingVerifier::new(&path, Box::new(script));
        verifier
            .verify("uptermd.example", 22, "198.51.100.4:22", &key)
            .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn garbage_then_no_declines_without_appending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let script = leak(Script::answering(&["maybe", "no"]));
        let verifier = PromptingVerifier::new(&path, Box::new(script));
        let err = verifier
            .verify("uptermd.example", 22, "198.51.100.4:22", &server_key(KEY_A))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KnownHostsError>(),
            Some(KnownHostsError::Declined { .. })
        ));
        assert!(!path.exists());
        // The re-prompt is the terse form.
        let transcript = script.transcript.lock();
        assert!(transcript
            .iter()
            .any(|l| l.starts_with("Please type 'yes', 'no' or the fingerprint")));
    }

    #[test]
    fn known_host_is_silently_trusted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, format!("uptermd.example {KEY_A}\n")).unwrap();
        let script = leak(Script::answering(&[]));
        let verifier = PromptingVerifier::new(&path, Box::new(script));
        verifier
            .verify("uptermd.example", 22, "198.51.100.4:22", &server_key(KEY_A))
            .unwrap();
        k9::assert_equal!(script.transcript.lock().len(), 0);
    }

    #[test]
    fn accept_new_records_and_warns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let script = leak(Script::default());
        let verifier = AcceptNewVerifier::new(&path, Box::new(script));
        verifier
            .verify("uptermd.example", 2222, "198.51.100.4:2222", &server_key(KEY_A))
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("[uptermd.example]:2222 "));
        let transcript = script.transcript.lock();
        k9::assert_equal!(
            transcript[0],
            "Warning: Permanently added '[uptermd.example]:2222' (ED25519) to the list of known hosts."
        );
    }

    #[test]
    fn changed_key_fails_with_offending_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(
            &path,
            format!("# header\nuptermd.example {KEY_A}\n"),
        )
        .unwrap();
        let script = leak(Script::default());
        let verifier = AcceptNewVerifier::new(&path, Box::new(script));
        let err = verifier
            .verify("uptermd.example", 22, "198.51.100.4:22", &server_key(KEY_B))
            .unwrap_err();
        match err.downcast_ref::<KnownHostsError>() {
            Some(KnownHostsError::Mismatch { line, .. }) => k9::assert_equal!(*line, 2),
            other => panic!("expected mismatch, got {other:?}"),
        }
        let transcript = script.transcript.lock();
        assert!(transcript
            .iter()
            .any(|l| l.contains("REMOTE HOST IDENTIFICATION HAS CHANGED")));
    }

    #[test]
    fn wildcard_patterns_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, format!("*.example {KEY_A}\n")).unwrap();
        let script = leak(Script::default());
        let verifier = AcceptNewVerifier::new(&path, Box::new(script));
        verifier
            .verify("uptermd.example", 22, "198.51.100.4:22", &server_key(KEY_A))
            .unwrap();
        // Nothing appended; the wildcard entry vouched for the host.
        let contents = std::fs::read_to_string(&path).unwrap();
        k9::assert_equal!(contents.lines().count(), 1);
    }

    // A host certificate whose signature key is KEY_C; the signature
    // itself is never checked here (that is the transport's job).
    const HOST_CERT: &str = "ssh-ed25519-cert-v01@openssh.com AAAAIHNzaC1lZDI1NTE5LWNlcnQtdjAxQG9wZW5zc2guY29tAAAAIAcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHAAAAIAkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJAAAAAAAAAAEAAAACAAAAD3VwdGVybWQuZXhhbXBsZQAAABMAAAAPdXB0ZXJtZC5leGFtcGxlAAAAAAAAAAD//////////wAAAAAAAAAAAAAAAAAAADMAAAALc3NoLWVkMjU1MTkAAAAgAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMAAABTAAAAC3NzaC1lZDI1NTE5AAAAQAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";
    const KEY_C: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMD";

    #[test]
    fn certificate_appends_cert_authority_marker_with_ca_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let cert = Certificate::from_openssh(HOST_CERT).unwrap();
        let key = ServerKey::Cert(cert);
        let script = leak(Script::default());
        let verifier = AcceptNewVerifier::new(&path, Box::new(script));
        verifier
            .verify("uptermd.example", 22, "198.51.100.4:22", &key)
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let ca = PublicKey::from_openssh(KEY_C).unwrap();
        assert!(contents.starts_with("@cert-authority uptermd.example ssh-ed25519 "));
        // The stored key is the CA's signature key, not the certificate.
        k9::assert_equal!(key.stored_key().key_data(), ca.key_data());
        assert!(!contents.contains("cert-v01"));
    }

    #[test]
    fn plain_host_key_classifies_as_plain() {
        let key = PublicKey::from_openssh(KEY_A).unwrap();
        let classified = ServerKey::from_public_key(&key);
        assert!(!classified.is_cert());
        k9::assert_equal!(classified.stored_key().key_data(), key.key_data());
    }

    #[test]
    fn certificate_is_trusted_by_existing_ca_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(
            &path,
            format!("@cert-authority uptermd.example {KEY_C}\n"),
        )
        .unwrap();
        let cert = Certificate::from_openssh(HOST_CERT).unwrap();
        let script = leak(Script::default());
        let verifier = AcceptNewVerifier::new(&path, Box::new(script));
        verifier
            .verify("uptermd.example", 22, "198.51.100.4:22", &ServerKey::Cert(cert))
            .unwrap();
        // A ca line never vouches for a plain key of the same material.
        let plain = server_key(KEY_C);
        let err = verifier.verify("uptermd.example", 22, "198.51.100.4:22", &plain);
        // Plain key is unknown, so accept-new appends rather than erring.
        assert!(err.is_ok());
        let contents = std::fs::read_to_string(&path).unwrap();
        k9::assert_equal!(contents.lines().count(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn store_file_and_directory_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".ssh").join("known_hosts");
        let script = leak(Script::default());
        let verifier = AcceptNewVerifier::new(&path, Box::new(script));
        verifier
            .verify("uptermd.example", 22, "198.51.100.4:22", &server_key(KEY_A))
            .unwrap();
        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        k9::assert_equal!(file_mode, 0o600);
        k9::assert_equal!(dir_mode, 0o700);
    }
}
