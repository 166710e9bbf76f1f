//! Unix backend: openpty(3) plus the handful of tty ioctls the host
//! needs, wrapped behind the crate's trait seam.

use crate::{Child, CommandBuilder, ExitStatus, MasterPty, PtyPair, PtySize, SlavePty};
use anyhow::Context as _;
use filedescriptor::FileDescriptor;
use libc::winsize;
use std::io;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::ptr;

fn winsize_from(size: PtySize) -> winsize {
    winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: size.pixel_width,
        ws_ypixel: size.pixel_height,
    }
}

fn size_from(ws: winsize) -> PtySize {
    PtySize {
        rows: ws.ws_row,
        cols: ws.ws_col,
        pixel_width: ws.ws_xpixel,
        pixel_height: ws.ws_ypixel,
    }
}

/// Mark a descriptor close-on-exec so neither end of the pair leaks
/// into the spawned child (the child gets its stdio wired up from
/// fresh dups instead).
fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn openpty(size: PtySize) -> anyhow::Result<PtyPair> {
    let mut master_fd: RawFd = -1;
    let mut slave_fd: RawFd = -1;
    let mut ws = winsize_from(size);

    let rc = unsafe {
        libc::openpty(
            &mut master_fd,
            &mut slave_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            &mut ws,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error()).context("openpty");
    }

    // From here on the descriptors are owned; failures below drop and
    // close them.
    let master = TtyFd(unsafe { FileDescriptor::from_raw_fd(master_fd) });
    let slave = TtyFd(unsafe { FileDescriptor::from_raw_fd(slave_fd) });
    set_cloexec(master.raw()).context("marking the master cloexec")?;
    set_cloexec(slave.raw()).context("marking the slave cloexec")?;

    Ok(PtyPair {
        master: Box::new(NativeMaster { fd: master }),
        slave: Box::new(NativeSlave { fd: slave }),
    })
}

/// One end of the pty pair.  Closed on drop.
struct TtyFd(FileDescriptor);

impl TtyFd {
    fn raw(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    fn dup(&self) -> anyhow::Result<TtyFd> {
        Ok(TtyFd(self.0.try_clone()?))
    }

    fn set_size(&self, size: PtySize) -> anyhow::Result<()> {
        let ws = winsize_from(size);
        if unsafe { libc::ioctl(self.raw(), libc::TIOCSWINSZ, &ws as *const _) } != 0 {
            anyhow::bail!("TIOCSWINSZ: {}", io::Error::last_os_error());
        }
        Ok(())
    }

    fn get_size(&self) -> anyhow::Result<PtySize> {
        let mut ws: winsize = unsafe { std::mem::zeroed() };
        if unsafe { libc::ioctl(self.raw(), libc::TIOCGWINSZ, &mut ws as *mut _) } != 0 {
            anyhow::bail!("TIOCGWINSZ: {}", io::Error::last_os_error());
        }
        Ok(size_from(ws))
    }
}

impl Read for TtyFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buf) {
            // Some kernels answer reads on the master with EIO once the
            // slave side is gone.  Callers uniformly want "the session
            // is over", which is what 0 says.
            Err(ref e) if e.raw_os_error() == Some(libc::EIO) => Ok(0),
            other => other,
        }
    }
}

impl Write for TtyFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// Runs in the forked child, pre-exec: give it a clean signal slate,
/// its own session, and the slave as controlling terminal.  Without
/// TIOCSCTTY the kernel has no tty to deliver SIGWINCH to on resize.
fn prepare_session_leader() -> io::Result<()> {
    const RESET: [libc::c_int; 6] = [
        libc::SIGCHLD,
        libc::SIGHUP,
        libc::SIGINT,
        libc::SIGQUIT,
        libc::SIGTERM,
        libc::SIGALRM,
    ];
    for sig in RESET {
        unsafe { libc::signal(sig, libc::SIG_DFL) };
    }
    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }
    // stdin is already the slave at this point.
    if unsafe { libc::ioctl(0, libc::TIOCSCTTY as _, 0) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

struct NativeMaster {
    fd: TtyFd,
}

struct NativeSlave {
    fd: TtyFd,
}

impl MasterPty for NativeMaster {
    fn resize(&self, size: PtySize) -> anyhow::Result<()> {
        self.fd.set_size(size)
    }

    fn get_size(&self) -> anyhow::Result<PtySize> {
        self.fd.get_size()
    }

    fn try_clone_reader(&self) -> anyhow::Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.fd.dup()?))
    }

    fn take_writer(&self) -> anyhow::Result<Box<dyn Write + Send>> {
        Ok(Box::new(self.fd.dup()?))
    }
}

impl SlavePty for NativeSlave {
    fn spawn_command(&self, builder: CommandBuilder) -> anyhow::Result<Box<dyn Child>> {
        let mut cmd = builder.as_command()?;

        unsafe {
            cmd.stdin(self.fd.0.as_stdio()?)
                .stdout(self.fd.0.as_stdio()?)
                .stderr(self.fd.0.as_stdio()?)
                .pre_exec(prepare_session_leader)
        };

        let mut spawned = cmd.spawn().context("spawning child in pty")?;
        // std's Child would keep its own copies of the slave stdio
        // alive; the master is the only end we talk through.
        spawned.stdin.take();
        spawned.stdout.take();
        spawned.stderr.take();

        let pid = spawned.id() as libc::pid_t;
        Ok(Box::new(UnixChild {
            pid,
            child: spawned,
        }))
    }
}

/// Signal the process group led by `pid` with SIGKILL, falling back to
/// the bare pid when the group is already gone.  Children spawned by
/// this crate are session leaders, so their pid doubles as the pgid.
pub fn kill_process_group(pid: u32) -> io::Result<()> {
    let pid = pid as libc::pid_t;
    if unsafe { libc::killpg(pid, libc::SIGKILL) } != 0 {
        let err = io::Error::last_os_error();
        if unsafe { libc::kill(pid, libc::SIGKILL) } != 0 {
            return Err(err);
        }
    }
    Ok(())
}

/// Waiting is delegated to the std `Child`; killing targets the whole
/// group established at spawn so no descendant outlives the handle.
#[derive(Debug)]
struct UnixChild {
    pid: libc::pid_t,
    child: std::process::Child,
}

impl Child for UnixChild {
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait().map(|s| s.map(Into::into))
    }

    fn kill(&mut self) -> io::Result<()> {
        kill_process_group(self.pid as u32)
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().map(Into::into)
    }

    fn process_id(&self) -> u32 {
        self.pid as u32
    }
}
