//! Signalling a process together with every descendant it spawned
//!
//! The app child may start its own workers or servers; a restart must take
//! those down too. The tree is snapshotted with `sysinfo` before any signal is
//! sent, so a parent dying first cannot orphan its children out of the walk.

use std::collections::HashMap;

use sysinfo::{ProcessesToUpdate, System};

use devloop_core::prelude::*;

/// Signal escalation steps used by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeSignal {
    /// SIGTERM: ask politely
    Terminate,
    /// SIGKILL: no way to refuse
    Kill,
}

impl std::fmt::Display for TreeSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeSignal::Terminate => write!(f, "SIGTERM"),
            TreeSignal::Kill => write!(f, "SIGKILL"),
        }
    }
}

/// `root` followed by all of its descendants, parents before children
pub fn collect_tree(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children
                .entry(parent.as_u32())
                .or_default()
                .push(pid.as_u32());
        }
    }

    tree_from_parent_map(root, &children)
}

fn tree_from_parent_map(root: u32, children: &HashMap<u32, Vec<u32>>) -> Vec<u32> {
    let mut tree = vec![root];
    let mut index = 0;
    while index < tree.len() {
        if let Some(kids) = children.get(&tree[index]) {
            for kid in kids {
                if !tree.contains(kid) {
                    tree.push(*kid);
                }
            }
        }
        index += 1;
    }
    tree
}

/// Deliver `signal` to `root` and all of its descendants.
///
/// Returns `Ok(false)` when nothing in the tree was still alive. A process
/// vanishing between the snapshot and the signal is not an error: gone is
/// the goal state.
#[cfg(unix)]
pub fn signal_tree(root: u32, signal: TreeSignal) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        TreeSignal::Terminate => Signal::SIGTERM,
        TreeSignal::Kill => Signal::SIGKILL,
    };

    let tree = collect_tree(root);
    debug!("Sending {} to process tree {:?}", signal, tree);

    let mut delivered = false;

    // Children under a pty are session leaders, so the group id is the root pid.
    match killpg(Pid::from_raw(root as i32), sig) {
        Ok(()) => delivered = true,
        Err(Errno::ESRCH) | Err(Errno::EPERM) => {}
        Err(e) => warn!("killpg({}) failed: {}", root, e),
    }

    for pid in tree {
        match kill(Pid::from_raw(pid as i32), sig) {
            Ok(()) => delivered = true,
            Err(Errno::ESRCH) => trace!("pid {} already gone", pid),
            // A descendant that dropped privileges must not block the root.
            Err(Errno::EPERM) if pid != root => {
                warn!("Not permitted to send {} to descendant pid {}", signal, pid)
            }
            Err(e) => {
                return Err(Error::process(format!(
                    "failed to send {} to pid {}: {}",
                    signal, pid, e
                )))
            }
        }
    }

    Ok(delivered)
}

#[cfg(not(unix))]
pub fn signal_tree(root: u32, signal: TreeSignal) -> Result<bool> {
    use sysinfo::Pid;

    let tree = collect_tree(root);
    debug!("Killing process tree {:?} ({})", tree, signal);

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut delivered = false;
    for pid in tree.into_iter().rev() {
        if let Some(process) = system.process(Pid::from_u32(pid)) {
            delivered |= process.kill();
        }
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_from_parent_map_walks_all_levels() {
        let mut children = HashMap::new();
        children.insert(10, vec![11, 12]);
        children.insert(11, vec![13]);
        children.insert(99, vec![100]);

        assert_eq!(tree_from_parent_map(10, &children), vec![10, 11, 12, 13]);
    }

    #[test]
    fn test_tree_from_parent_map_leaf() {
        let children = HashMap::new();
        assert_eq!(tree_from_parent_map(42, &children), vec![42]);
    }

    #[test]
    fn test_tree_from_parent_map_ignores_cycles() {
        let mut children = HashMap::new();
        children.insert(1, vec![2]);
        children.insert(2, vec![1]);
        assert_eq!(tree_from_parent_map(1, &children), vec![1, 2]);
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_tree_kills_running_process() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("sleep must be available in test environment");

        let delivered = signal_tree(child.id(), TreeSignal::Terminate).unwrap();
        assert!(delivered);

        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(15));
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_tree_on_reaped_process_is_not_an_error() {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("true must be available in test environment");
        let pid = child.id();
        child.wait().unwrap();

        assert!(!signal_tree(pid, TreeSignal::Kill).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_collect_tree_includes_grandchildren() {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "sleep 30 & wait"])
            .spawn()
            .expect("sh must be available in test environment");
        let pid = child.id();

        let mut tree = collect_tree(pid);
        for _ in 0..50 {
            if tree.len() > 1 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
            tree = collect_tree(pid);
        }

        assert_eq!(tree[0], pid);
        assert!(tree.len() >= 2, "expected the sleep child in {:?}", tree);

        signal_tree(pid, TreeSignal::Kill).unwrap();
        child.wait().unwrap();
    }
}
