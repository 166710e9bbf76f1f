//! The sftp subsystem: a filesystem-backed request server with a
//! per-session permission gate.
//!
//! Listing-class operations (directory reads, stat, readlink) are never
//! gated: they expose names, not contents.  Everything else consults
//! the session's `PermissionChecker` — the seam behind which the CLI
//! hangs its confirmation dialog — and caches the outcome per session.
//! A checker *error* allows the operation: the peer already proved
//! possession of an authorized key, and a missing dialog on a headless
//! host must not turn into a denial of service.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// The operations a checker can be asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileOperation {
    Get,
    Put,
    Remove,
    Mkdir,
    Rmdir,
    Rename,
    Symlink,
    Link,
    Setstat,
    List,
    Stat,
    Lstat,
    Readlink,
}

impl FileOperation {
    /// Listing-class operations bypass the gate entirely.
    fn is_listing(self) -> bool {
        matches!(
            self,
            FileOperation::List
                | FileOperation::Stat
                | FileOperation::Lstat
                | FileOperation::Readlink
        )
    }

    /// Operations that mutate the filesystem; these are what read-only
    /// mode forbids.
    fn is_write(self) -> bool {
        matches!(
            self,
            FileOperation::Put
                | FileOperation::Remove
                | FileOperation::Mkdir
                | FileOperation::Rmdir
                | FileOperation::Rename
                | FileOperation::Symlink
                | FileOperation::Link
                | FileOperation::Setstat
        )
    }
}

impl std::fmt::Display for FileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// What the user answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    /// Allow this operation on these exact paths, this session only.
    AllowOnce,
    /// Allow everything else this session asks for.
    AllowAll,
    Deny,
}

/// Who is asking.
#[derive(Debug, Clone)]
pub struct SftpClientInfo {
    pub session_id: String,
    pub fingerprint: String,
}

/// The confirmation seam.  Implementations typically raise a dialog on
/// the host; tests script it.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn check(
        &self,
        op: FileOperation,
        client: &SftpClientInfo,
        paths: &[String],
    ) -> anyhow::Result<PermissionDecision>;
}

/// Per-session decision cache in front of a checker.
pub struct PermissionGate {
    read_only: bool,
    checker: Option<Arc<dyn PermissionChecker>>,
    client: SftpClientInfo,
    state: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    allow_all: bool,
    allowed: HashSet<(FileOperation, Vec<String>)>,
}

impl PermissionGate {
    pub fn new(
        read_only: bool,
        checker: Option<Arc<dyn PermissionChecker>>,
        client: SftpClientInfo,
    ) -> Self {
        Self {
            read_only,
            checker,
            client,
            state: Mutex::new(GateState::default()),
        }
    }

    /// Decide whether the operation may proceed.  Read-only denials
    /// happen before anything else so no gated write ever touches the
    /// filesystem.
    pub async fn allow(&self, op: FileOperation, paths: &[String]) -> bool {
        if op.is_listing() {
            return true;
        }
        if self.read_only && op.is_write() {
            return false;
        }
        {
            let state = self.state.lock();
            if state.allow_all {
                return true;
            }
            if state.allowed.contains(&(op, paths.to_vec())) {
                return true;
            }
        }
        let Some(checker) = &self.checker else {
            return true;
        };
        match checker.check(op, &self.client, paths).await {
            Ok(PermissionDecision::AllowOnce) => {
                self.state.lock().allowed.insert((op, paths.to_vec()));
                true
            }
            Ok(PermissionDecision::AllowAll) => {
                self.state.lock().allow_all = true;
                true
            }
            Ok(PermissionDecision::Deny) => false,
            Err(err) => {
                log::warn!(
                    "permission checker failed for {op} by {}; allowing: {err:#}",
                    self.client.session_id
                );
                true
            }
        }
    }
}

enum OpenHandle {
    File { file: tokio::fs::File, path: PathBuf },
    Dir { entries: Vec<File>, offset: usize },
}

/// One sftp subsystem instance; dropped (cache and all) when the
/// session ends.
pub struct SftpSession {
    gate: PermissionGate,
    home: PathBuf,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
}

impl SftpSession {
    pub fn new(
        read_only: bool,
        checker: Option<Arc<dyn PermissionChecker>>,
        client: SftpClientInfo,
    ) -> anyhow::Result<Self> {
        let home = dirs_next::home_dir()
            .ok_or_else(|| anyhow::anyhow!("cannot determine the home directory"))?;
        Ok(Self {
            gate: PermissionGate::new(read_only, checker, client),
            home,
            handles: HashMap::new(),
            next_handle: 0,
        })
    }

    /// `~` and relative paths resolve under home; absolute paths are
    /// cleaned and used as-is.
    fn resolve(&self, path: &str) -> PathBuf {
        let expanded = if path == "~" || path.is_empty() || path == "." {
            self.home.clone()
        } else if let Some(rest) = path.strip_prefix("~/") {
            self.home.join(rest)
        } else {
            let p = Path::new(path);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                self.home.join(p)
            }
        };
        clean_path(&expanded)
    }

    fn take_handle(&mut self) -> String {
        self.next_handle += 1;
        self.next_handle.to_string()
    }

    fn ok_status(id: u32) -> Status {
        Status {
            id,
            status_code: StatusCode::Ok,
            error_message: "Ok".to_string(),
            language_tag: "en-US".to_string(),
        }
    }
}

/// Lexically normalize a path: `.` disappears, `..` pops.
fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

fn io_status(err: &std::io::Error) -> StatusCode {
    match err.kind() {
        std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

fn str_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        _version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        Ok(Version::new())
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let resolved = self.resolve(&path);
        Ok(Name {
            id,
            files: vec![File::dummy(str_path(&resolved))],
        })
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let path = self.resolve(&filename);
        let writing = pflags.intersects(
            OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        );
        let op = if writing {
            FileOperation::Put
        } else {
            FileOperation::Get
        };
        if !self.gate.allow(op, &[str_path(&path)]).await {
            return Err(StatusCode::PermissionDenied);
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.read(pflags.contains(OpenFlags::READ) || !writing);
        if pflags.contains(OpenFlags::WRITE) {
            options.write(true);
        }
        if pflags.contains(OpenFlags::APPEND) {
            options.append(true);
        }
        if pflags.contains(OpenFlags::CREATE) {
            options.create(true);
        }
        if pflags.contains(OpenFlags::TRUNCATE) {
            options.truncate(true);
        }
        if pflags.contains(OpenFlags::EXCLUDE) {
            options.create_new(true);
        }

        let file = options.open(&path).await.map_err(|e| io_status(&e))?;
        let handle = self.take_handle();
        self.handles.insert(handle.clone(), OpenHandle::File { file, path });
        Ok(Handle { id, handle })
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let Some(OpenHandle::File { file, .. }) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| io_status(&e))?;
        let mut data = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < data.len() {
            let n = file
                .read(&mut data[filled..])
                .await
                .map_err(|e| io_status(&e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Err(StatusCode::Eof);
        }
        data.truncate(filled);
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let Some(OpenHandle::File { file, .. }) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| io_status(&e))?;
        file.write_all(&data).await.map_err(|e| io_status(&e))?;
        Ok(Self::ok_status(id))
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        self.handles.remove(&handle);
        Ok(Self::ok_status(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let path = self.resolve(&path);
        // Directory listing is never gated.
        let mut read_dir = tokio::fs::read_dir(&path).await.map_err(|e| io_status(&e))?;
        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await.map_err(|e| io_status(&e))? {
            let attrs = match entry.metadata().await {
                Ok(metadata) => FileAttributes::from(&metadata),
                Err(_) => FileAttributes::default(),
            };
            entries.push(File::new(entry.file_name().to_string_lossy(), attrs));
        }
        let handle = self.take_handle();
        self.handles
            .insert(handle.clone(), OpenHandle::Dir { entries, offset: 0 });
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let Some(OpenHandle::Dir { entries, offset }) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };
        if *offset >= entries.len() {
            return Err(StatusCode::Eof);
        }
        // Hand back a screenful at a time; clients iterate until EOF.
        let batch: Vec<File> = entries.iter().skip(*offset).take(128).cloned().collect();
        *offset += batch.len();
        Ok(Name { id, files: batch })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let path = self.resolve(&path);
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| io_status(&e))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let path = self.resolve(&path);
        let metadata = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| io_status(&e))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let Some(OpenHandle::File { file, .. }) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };
        let metadata = file.metadata().await.map_err(|e| io_status(&e))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let path = self.resolve(&path);
        if !self
            .gate
            .allow(FileOperation::Setstat, &[str_path(&path)])
            .await
        {
            return Err(StatusCode::PermissionDenied);
        }
        if let Some(permissions) = attrs.permissions {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(
                    &path,
                    std::fs::Permissions::from_mode(permissions & 0o7777),
                )
                .await
                .map_err(|e| io_status(&e))?;
            }
        }
        if let Some(size) = attrs.size {
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(|e| io_status(&e))?;
            file.set_len(size).await.map_err(|e| io_status(&e))?;
        }
        Ok(Self::ok_status(id))
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        let path = self.resolve(&filename);
        if !self
            .gate
            .allow(FileOperation::Remove, &[str_path(&path)])
            .await
        {
            return Err(StatusCode::PermissionDenied);
        }
        tokio::fs::remove_file(&path).await.map_err(|e| io_status(&e))?;
        Ok(Self::ok_status(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let path = self.resolve(&path);
        if !self
            .gate
            .allow(FileOperation::Mkdir, &[str_path(&path)])
            .await
        {
            return Err(StatusCode::PermissionDenied);
        }
        tokio::fs::create_dir(&path).await.map_err(|e| io_status(&e))?;
        Ok(Self::ok_status(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        let path = self.resolve(&path);
        if !self
            .gate
            .allow(FileOperation::Rmdir, &[str_path(&path)])
            .await
        {
            return Err(StatusCode::PermissionDenied);
        }
        tokio::fs::remove_dir(&path).await.map_err(|e| io_status(&e))?;
        Ok(Self::ok_status(id))
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        let old = self.resolve(&oldpath);
        let new = self.resolve(&newpath);
        if !self
            .gate
            .allow(FileOperation::Rename, &[str_path(&old), str_path(&new)])
            .await
        {
            return Err(StatusCode::PermissionDenied);
        }
        tokio::fs::rename(&old, &new).await.map_err(|e| io_status(&e))?;
        Ok(Self::ok_status(id))
    }

    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        let link = self.resolve(&linkpath);
        let target = self.resolve(&targetpath);
        if !self
            .gate
            .allow(
                FileOperation::Symlink,
                &[str_path(&link), str_path(&target)],
            )
            .await
        {
            return Err(StatusCode::PermissionDenied);
        }
        #[cfg(unix)]
        tokio::fs::symlink(&target, &link)
            .await
            .map_err(|e| io_status(&e))?;
        Ok(Self::ok_status(id))
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let path = self.resolve(&path);
        let target = tokio::fs::read_link(&path).await.map_err(|e| io_status(&e))?;
        Ok(Name {
            id,
            files: vec![File::dummy(str_path(&target))],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedChecker {
        decisions: Mutex<Vec<PermissionDecision>>,
        calls: Mutex<Vec<(FileOperation, Vec<String>)>>,
    }

    impl ScriptedChecker {
        fn new(decisions: Vec<PermissionDecision>) -> Arc<Self> {
            Arc::new(Self {
                decisions: Mutex::new(decisions),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PermissionChecker for ScriptedChecker {
        async fn check(
            &self,
            op: FileOperation,
            _client: &SftpClientInfo,
            paths: &[String],
        ) -> anyhow::Result<PermissionDecision> {
            self.calls.lock().push((op, paths.to_vec()));
            let mut decisions = self.decisions.lock();
            if decisions.is_empty() {
                anyhow::bail!("no decision scripted");
            }
            Ok(decisions.remove(0))
        }
    }

    fn client() -> SftpClientInfo {
        SftpClientInfo {
            session_id: "sess".into(),
            fingerprint: "SHA256:test".into(),
        }
    }

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn read_only_denies_writes_without_consulting_checker() {
        let checker = ScriptedChecker::new(vec![PermissionDecision::AllowAll]);
        let gate = PermissionGate::new(true, Some(checker.clone()), client());
        for op in [
            FileOperation::Put,
            FileOperation::Remove,
            FileOperation::Mkdir,
            FileOperation::Rmdir,
            FileOperation::Rename,
            FileOperation::Symlink,
            FileOperation::Setstat,
        ] {
            assert!(!gate.allow(op, &paths(&["/tmp/x"])).await, "{op} allowed");
        }
        assert!(checker.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn read_only_still_allows_downloads_and_listing() {
        let gate = PermissionGate::new(true, None, client());
        assert!(gate.allow(FileOperation::Get, &paths(&["/tmp/x"])).await);
        assert!(gate.allow(FileOperation::List, &paths(&["/tmp"])).await);
    }

    #[tokio::test]
    async fn listing_operations_bypass_the_checker() {
        let checker = ScriptedChecker::new(vec![]);
        let gate = PermissionGate::new(false, Some(checker.clone()), client());
        for op in [
            FileOperation::List,
            FileOperation::Stat,
            FileOperation::Lstat,
            FileOperation::Readlink,
        ] {
            assert!(gate.allow(op, &paths(&["/tmp"])).await);
        }
        assert!(checker.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn allow_once_caches_exact_paths_only() {
        let checker = ScriptedChecker::new(vec![
            PermissionDecision::AllowOnce,
            PermissionDecision::Deny,
        ]);
        let gate = PermissionGate::new(false, Some(checker.clone()), client());

        assert!(gate.allow(FileOperation::Get, &paths(&["/tmp/a"])).await);
        // Same op and paths: served from cache, no new checker call.
        assert!(gate.allow(FileOperation::Get, &paths(&["/tmp/a"])).await);
        k9::assert_equal!(checker.calls.lock().len(), 1);
        // A different path consults the checker again and is denied.
        assert!(!gate.allow(FileOperation::Get, &paths(&["/tmp/b"])).await);
    }

    #[tokio::test]
    async fn allow_all_short_circuits_the_session() {
        // The seed scenario: a download answered "allow all"
        // auto-approves a later upload of a different path.
        let checker = ScriptedChecker::new(vec![PermissionDecision::AllowAll]);
        let gate = PermissionGate::new(false, Some(checker.clone()), client());

        assert!(gate.allow(FileOperation::Get, &paths(&["/tmp/a"])).await);
        assert!(gate.allow(FileOperation::Put, &paths(&["/tmp/b"])).await);
        k9::assert_equal!(checker.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn a_new_gate_starts_with_an_empty_cache() {
        let checker = ScriptedChecker::new(vec![
            PermissionDecision::AllowAll,
            PermissionDecision::Deny,
        ]);
        let first = PermissionGate::new(false, Some(checker.clone()), client());
        assert!(first.allow(FileOperation::Get, &paths(&["/tmp/a"])).await);

        let second = PermissionGate::new(false, Some(checker.clone()), client());
        assert!(!second.allow(FileOperation::Get, &paths(&["/tmp/a"])).await);
        k9::assert_equal!(checker.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn checker_error_allows() {
        let checker = ScriptedChecker::new(vec![]);
        let gate = PermissionGate::new(false, Some(checker.clone()), client());
        assert!(gate.allow(FileOperation::Put, &paths(&["/tmp/a"])).await);
    }

    #[tokio::test]
    async fn deny_is_not_cached() {
        let checker = ScriptedChecker::new(vec![
            PermissionDecision::Deny,
            PermissionDecision::AllowOnce,
        ]);
        let gate = PermissionGate::new(false, Some(checker.clone()), client());
        assert!(!gate.allow(FileOperation::Put, &paths(&["/tmp/a"])).await);
        // Asking again consults the checker afresh.
        assert!(gate.allow(FileOperation::Put, &paths(&["/tmp/a"])).await);
        k9::assert_equal!(checker.calls.lock().len(), 2);
    }

    #[test]
    fn clean_path_normalizes() {
        k9::assert_equal!(
            clean_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
    }
}
