//! Topology sharing through System V shared memory.
//!
//! Both clients live in one test process, so they share a pid; mastership
//! still moves only through the lock and the heartbeat. Tests skip when
//! the host refuses SysV segments.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use spire_client::config::AttachFailure;
use spire_client::{Client, ClientConfig, ClientError, Key, Value};

use crate::helpers::{wait_for, FakeCluster, NAMESPACE};

static NEXT_KEY: AtomicI32 = AtomicI32::new(0);

/// Removes the segment once every attachment is gone.
struct Segment(i32);

impl Segment {
    fn unique() -> Self {
        let pid = (std::process::id() & 0xfff) as i32;
        Segment(0x5a00_0000 | (pid << 8) | NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: plain syscalls on a key this test owns
        unsafe {
            let id = libc::shmget(self.0, 0, 0);
            if id >= 0 {
                libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut());
            }
        }
    }
}

fn shared_config(cluster: &FakeCluster, segment: &Segment) -> ClientConfig {
    let mut config = cluster.config();
    config.shm.enabled = true;
    config.shm.key = segment.0;
    config.shm.takeover_threshold = Duration::from_secs(2);
    config
}

/// Connects, or returns `None` when shared memory is unavailable here.
fn connect_shared(config: ClientConfig) -> Option<Client> {
    match Client::connect(config) {
        Ok(client) => Some(client),
        Err(ClientError::Shm(e)) => {
            eprintln!("skipping: shared memory unavailable: {e}");
            None
        }
        Err(e) => panic!("connect failed: {e}"),
    }
}

#[test]
fn follower_uses_the_masters_topology_and_takes_over_on_close() {
    let segment = Segment::unique();
    let cluster = FakeCluster::start(2);
    let Some(first) = connect_shared(shared_config(&cluster, &segment)) else {
        return;
    };
    assert!(first.cluster().is_shared());
    assert!(first.cluster().is_tend_master());

    let second = Client::connect(shared_config(&cluster, &segment)).unwrap();
    assert!(second.cluster().is_shared());
    assert!(!second.cluster().is_tend_master());
    assert!(wait_for(Duration::from_secs(1), || {
        second.cluster().node_names().len() == 2
    }));

    let key = Key::new(NAMESPACE, "shm", "k").unwrap();
    first.put(&key, &[("v", Value::Int(1))]).unwrap();
    let record = second.get(&key, &[]).unwrap().unwrap();
    assert_eq!(record.get("v"), Some(&Value::Int(1)));

    // a graceful close hands over well before the takeover threshold
    first.close();
    assert!(wait_for(Duration::from_millis(500), || {
        second.cluster().is_tend_master()
    }));
    assert_eq!(second.cluster().node_names().len(), 2);
}

#[test]
fn mismatched_segment_falls_back_to_local_tending() {
    let segment = Segment::unique();
    let cluster = FakeCluster::start(1);
    let Some(_first) = connect_shared(shared_config(&cluster, &segment)) else {
        return;
    };

    let mut config = shared_config(&cluster, &segment);
    config.shm.max_nodes = 4;
    let err = Client::connect(config.clone()).unwrap_err();
    assert!(matches!(err, ClientError::Shm(_)), "{err:?}");

    config.shm.on_attach_failure = AttachFailure::Local;
    let local = Client::connect(config).unwrap();
    assert!(!local.cluster().is_shared());
    assert_eq!(local.cluster().node_names(), ["N0"]);
}
