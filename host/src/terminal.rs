//! Terminal window events and the pty-size coordinator.
//!
//! Every viewer of a pty (the host's own terminal plus each attached
//! remote) reports its window size.  The coordinator owns the mapping
//! from pty to its set of terminals and keeps the pty sized to the
//! pointwise minimum over all of them, so no viewer ever renders a
//! frame larger than its own window.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use upterm_pty::{MasterPty, PtySize};

/// Terminal id used by the host's own terminal; remote terminals use
/// their SSH session id.
pub const LOCAL_TERMINAL_ID: &str = "local";

pub type PtyRef = Arc<dyn MasterPty>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Window {
    pub width: u16,
    pub height: u16,
}

pub enum TerminalEvent {
    WindowChanged {
        pty: PtyRef,
        terminal_id: String,
        window: Window,
    },
    Detached {
        pty: PtyRef,
        terminal_id: String,
    },
}

/// Producer handle; emits never block.
#[derive(Clone)]
pub struct TerminalEventTx {
    tx: mpsc::UnboundedSender<TerminalEvent>,
}

impl TerminalEventTx {
    pub fn window_changed(&self, pty: &PtyRef, terminal_id: &str, width: u16, height: u16) {
        self.tx
            .send(TerminalEvent::WindowChanged {
                pty: pty.clone(),
                terminal_id: terminal_id.to_string(),
                window: Window { width, height },
            })
            .ok();
    }

    pub fn detached(&self, pty: &PtyRef, terminal_id: &str) {
        self.tx
            .send(TerminalEvent::Detached {
                pty: pty.clone(),
                terminal_id: terminal_id.to_string(),
            })
            .ok();
    }
}

pub fn channel() -> (TerminalEventTx, mpsc::UnboundedReceiver<TerminalEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TerminalEventTx { tx }, rx)
}

/// Ptys are keyed by the address of their shared handle; the handle
/// itself is kept alongside for issuing resizes.
fn pty_key(pty: &PtyRef) -> usize {
    Arc::as_ptr(pty) as *const () as usize
}

struct PtyTerminals {
    pty: PtyRef,
    terminals: HashMap<String, Window>,
}

/// Single-consumer coordinator: all mutations of the terminal map
/// happen on this task, so the pty only ever sees a resize matching the
/// current minimum over the observed set.
pub struct Coordinator {
    ptys: HashMap<usize, PtyTerminals>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            ptys: HashMap::new(),
        }
    }

    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<TerminalEvent>,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                event = rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => return Ok(()),
                },
            }
        }
    }

    fn handle(&mut self, event: TerminalEvent) {
        match event {
            TerminalEvent::WindowChanged {
                pty,
                terminal_id,
                window,
            } => {
                let key = pty_key(&pty);
                let entry = self.ptys.entry(key).or_insert_with(|| PtyTerminals {
                    pty,
                    terminals: HashMap::new(),
                });
                entry.terminals.insert(terminal_id, window);
                self.resize(key);
            }
            TerminalEvent::Detached { pty, terminal_id } => {
                let key = pty_key(&pty);
                if let Some(entry) = self.ptys.get_mut(&key) {
                    entry.terminals.remove(&terminal_id);
                    if entry.terminals.is_empty() {
                        self.ptys.remove(&key);
                    } else {
                        self.resize(key);
                    }
                }
            }
        }
    }

    fn resize(&mut self, key: usize) {
        let (pty, size) = {
            let Some(entry) = self.ptys.get(&key) else {
                return;
            };
            let Some(size) = min_window(entry.terminals.values()) else {
                // Every attached terminal reported zero for some dimension;
                // nothing trustworthy to resize to.
                return;
            };
            (entry.pty.clone(), size)
        };
        if let Err(err) = pty.resize(PtySize::new(size.height, size.width)) {
            let msg = format!("{err:#}");
            log::warn!("failed to resize pty to {}x{}: {msg}", size.width, size.height);
            if msg.contains("Bad file descriptor") {
                self.ptys.remove(&key);
            }
        }
    }

    #[cfg(test)]
    fn terminal_count(&self, pty: &PtyRef) -> usize {
        self.ptys
            .get(&pty_key(pty))
            .map(|e| e.terminals.len())
            .unwrap_or(0)
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Pointwise minimum over the windows, ignoring zero dimensions (a
/// terminal that has not reported a real size contributes nothing).
fn min_window<'a>(windows: impl Iterator<Item = &'a Window>) -> Option<Window> {
    let mut width: Option<u16> = None;
    let mut height: Option<u16> = None;
    for w in windows {
        if w.width > 0 {
            width = Some(width.map_or(w.width, |cur| cur.min(w.width)));
        }
        if w.height > 0 {
            height = Some(height.map_or(w.height, |cur| cur.min(w.height)));
        }
    }
    match (width, height) {
        (Some(width), Some(height)) => Some(Window { width, height }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakePty {
        resizes: Mutex<Vec<PtySize>>,
    }

    impl MasterPty for FakePty {
        fn resize(&self, size: PtySize) -> anyhow::Result<()> {
            self.resizes.lock().push(size);
            Ok(())
        }
        fn get_size(&self) -> anyhow::Result<PtySize> {
            Ok(self.resizes.lock().last().copied().unwrap_or_default())
        }
        fn try_clone_reader(&self) -> anyhow::Result<Box<dyn std::io::Read + Send>> {
            anyhow::bail!("not readable")
        }
        fn take_writer(&self) -> anyhow::Result<Box<dyn std::io::Write + Send>> {
            anyhow::bail!("not writable")
        }
    }

    struct BrokenPty;

    impl MasterPty for BrokenPty {
        fn resize(&self, _size: PtySize) -> anyhow::Result<()> {
            anyhow::bail!("failed to ioctl(TIOCSWINSZ): Bad file descriptor (os error 9)")
        }
        fn get_size(&self) -> anyhow::Result<PtySize> {
            anyhow::bail!("gone")
        }
        fn try_clone_reader(&self) -> anyhow::Result<Box<dyn std::io::Read + Send>> {
            anyhow::bail!("gone")
        }
        fn take_writer(&self) -> anyhow::Result<Box<dyn std::io::Write + Send>> {
            anyhow::bail!("gone")
        }
    }

    fn changed(c: &mut Coordinator, pty: &PtyRef, id: &str, w: u16, h: u16) {
        c.handle(TerminalEvent::WindowChanged {
            pty: pty.clone(),
            terminal_id: id.into(),
            window: Window {
                width: w,
                height: h,
            },
        });
    }

    #[test]
    fn resizes_to_minimum_and_rescales_on_detach() {
        let fake = Arc::new(FakePty::default());
        let pty: PtyRef = fake.clone();
        let mut c = Coordinator::new();

        changed(&mut c, &pty, LOCAL_TERMINAL_ID, 120, 40);
        changed(&mut c, &pty, "viewer-a", 100, 30);
        changed(&mut c, &pty, "viewer-b", 80, 25);
        k9::assert_equal!(*fake.resizes.lock().last().unwrap(), PtySize::new(25, 80));

        c.handle(TerminalEvent::Detached {
            pty: pty.clone(),
            terminal_id: "viewer-b".into(),
        });
        k9::assert_equal!(*fake.resizes.lock().last().unwrap(), PtySize::new(30, 100));
    }

    #[test]
    fn zero_dimensions_are_ignored() {
        let fake = Arc::new(FakePty::default());
        let pty: PtyRef = fake.clone();
        let mut c = Coordinator::new();

        changed(&mut c, &pty, "a", 0, 0);
        assert!(fake.resizes.lock().is_empty());

        changed(&mut c, &pty, "b", 90, 0);
        assert!(fake.resizes.lock().is_empty());

        changed(&mut c, &pty, "c", 100, 50);
        k9::assert_equal!(*fake.resizes.lock().last().unwrap(), PtySize::new(50, 90));
    }

    #[test]
    fn last_detach_drops_the_pty_entry() {
        let fake = Arc::new(FakePty::default());
        let pty: PtyRef = fake.clone();
        let mut c = Coordinator::new();

        changed(&mut c, &pty, "a", 80, 24);
        k9::assert_equal!(c.terminal_count(&pty), 1);
        c.handle(TerminalEvent::Detached {
            pty: pty.clone(),
            terminal_id: "a".into(),
        });
        k9::assert_equal!(c.terminal_count(&pty), 0);
    }

    #[test]
    fn closed_pty_is_dropped_after_resize_error() {
        let pty: PtyRef = Arc::new(BrokenPty);
        let mut c = Coordinator::new();
        changed(&mut c, &pty, "a", 80, 24);
        k9::assert_equal!(c.terminal_count(&pty), 0);
    }
}
