//! Demonstrates the two capabilities the host leans on most: resizing
//! a live pty and tearing down the child's whole process group.
//!
//! `stty size` samples the kernel's window size for the tty it runs
//! on, so spawning it after a resize shows the new geometry taking
//! effect.  The second half spawns a shell that forks a sleeping
//! grandchild, then kills the group; neither process survives.
use std::io::Read;

use upterm_pty::{openpty, CommandBuilder, PtySize};

fn main() {
    // Open at one size, resize before spawning, and let stty report
    // what the child actually sees.
    let pair = openpty(PtySize::default()).unwrap();
    pair.master.resize(PtySize::new(40, 100)).unwrap();

    let mut stty = CommandBuilder::new("stty");
    stty.arg("size");
    let mut child = pair.slave.spawn_command(stty).unwrap();
    drop(pair.slave);
    let mut reader = pair.master.try_clone_reader().unwrap();
    let status = child.wait().unwrap();
    // With the child reaped and the master dropped there is nothing
    // left to write, so the reader runs out cleanly.
    drop(pair.master);
    let mut out = String::new();
    reader.read_to_string(&mut out).unwrap();
    println!("stty exited {:?}, reported: {}", status, out.trim());

    // Kill the group: the sleep is a grandchild, but it shares the
    // session the pty child leads.
    let pair = openpty(PtySize::default()).unwrap();
    let mut shell = CommandBuilder::new("sh");
    shell.args(["-c", "sleep 600 & wait"]);
    let mut child = pair.slave.spawn_command(shell).unwrap();
    child.kill().unwrap();
    let status = child.wait().unwrap();
    println!("killed group, shell exited {:?}", status);
}
