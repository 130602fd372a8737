//! In-process cluster tests
//!
//! Each test boots one or two metadata servers on loopback TCP with an
//! in-memory store and drives them through the real client, covering
//! namespace operations, partition splits with redirection, leases, and
//! the embedded-to-backing file migration.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gigafs::client::FsClient;
use gigafs::config::ServerConfig;
use gigafs::giga::hash::{index_from_hash, name_hash};
use gigafs::giga::SplitPolicy;
use gigafs::rpc::proto::{Reply, Request, OPEN_READ, OPEN_WRITE};
use gigafs::rpc::{FsError, RpcClient, RpcServer};
use gigafs::server::MetadataServer;
use gigafs::store::MemStore;

struct TestCluster {
    config: ServerConfig,
    _root: tempfile::TempDir,
}

impl TestCluster {
    /// Boot `n` servers with the given split threshold. Threads live for
    /// the rest of the test process.
    fn start(n: usize, split_threshold: i64) -> Self {
        Self::start_with_policy(n, split_threshold, SplitPolicy::default())
    }

    fn start_with_policy(n: usize, split_threshold: i64, split_policy: SplitPolicy) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let listeners: Vec<TcpListener> = (0..n)
            .map(|_| TcpListener::bind("127.0.0.1:0").expect("bind"))
            .collect();
        let servers: Vec<String> = listeners
            .iter()
            .map(|l| l.local_addr().expect("local addr").to_string())
            .collect();

        for (id, listener) in listeners.into_iter().enumerate() {
            let mut config = ServerConfig::default();
            config.node.server_id = id as u32;
            config.node.log_level = "warn".to_string();
            config.paths.store_dir = root.path().join(format!("s{id}/store"));
            config.paths.file_dir = root.path().join(format!("s{id}/files"));
            config.paths.split_dir = root.path().join(format!("s{id}/splits"));
            config.network.servers = servers.clone();
            config.tuning.split_threshold = split_threshold;
            config.tuning.split_policy = split_policy;
            for dir in [
                &config.paths.store_dir,
                &config.paths.file_dir,
                &config.paths.split_dir,
            ] {
                std::fs::create_dir_all(dir).expect("create dirs");
            }

            let store = Arc::new(MemStore::new(id as u32));
            let (server, _engine) =
                MetadataServer::new(Arc::new(config), store).expect("server construction");
            if id == 0 {
                server.bootstrap_root().expect("bootstrap root");
            }
            RpcServer::spawn(server, listener);
        }

        let mut config = ServerConfig::default();
        config.network.servers = servers;
        config.tuning.split_threshold = split_threshold;
        Self {
            config,
            _root: root,
        }
    }

    fn client(&self) -> FsClient {
        FsClient::new(&self.config).expect("client construction")
    }

    fn raw(&self) -> RpcClient {
        RpcClient::new(
            self.config.server_addrs().expect("addrs"),
            Duration::from_secs(5),
        )
    }

    /// Poll the zeroth server of `dir_id` until the child bit shows up.
    fn wait_for_bit(&self, zeroth_server: u32, dir_id: u64, bit: u32) {
        let raw = self.raw();
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            if let Ok(Reply::Bitmap(wire)) = raw.call(zeroth_server, &Request::ReadBitmap { dir_id })
            {
                if wire.to_mapping().expect("mapping").bit(bit) {
                    return;
                }
            }
            assert!(
                Instant::now() < deadline,
                "bit {bit} of dir {dir_id} never appeared"
            );
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

#[test]
fn test_namespace_basics() {
    let cluster = TestCluster::start(1, 1 << 20);
    let client = cluster.client();

    assert!(client.ping().unwrap());

    client.mkdir("/a", 0o755).unwrap();
    client.mknod("/a/file", 0o644).unwrap();

    let root = client.getattr("/").unwrap();
    assert!(root.is_dir());

    let dir = client.getattr("/a").unwrap();
    assert!(dir.is_dir());
    assert_eq!(dir.mode & 0o7777, 0o755);

    let file = client.getattr("/a/file").unwrap();
    assert!(!file.is_dir());
    assert_eq!(file.mode & 0o7777, 0o644);
    assert_eq!(file.size, 0);

    // Duplicates are rejected and change nothing.
    assert!(matches!(
        client.mknod("/a/file", 0o600),
        Err(FsError::FileAlreadyExist)
    ));
    assert!(matches!(
        client.mkdir("/a", 0o700),
        Err(FsError::FileAlreadyExist)
    ));
    let unchanged = client.getattr("/a/file").unwrap();
    assert_eq!(unchanged.mode & 0o7777, 0o644);

    assert!(matches!(
        client.getattr("/a/nope"),
        Err(FsError::FileNotFound)
    ));
    assert!(matches!(
        client.mknod("/missing/f", 0o644),
        Err(FsError::ParentPathNotFound)
    ));
    // A regular file cannot serve as a path component.
    assert!(matches!(
        client.getattr("/a/file/x"),
        Err(FsError::NotADirectory)
    ));
}

#[test]
fn test_illegal_paths() {
    let cluster = TestCluster::start(1, 1 << 20);
    let client = cluster.client();

    assert!(matches!(client.getattr(""), Err(FsError::IllegalPath(_))));
    assert!(matches!(
        client.mknod("relative/path", 0o644),
        Err(FsError::IllegalPath(_))
    ));

    // Trailing slashes are stripped, not rejected.
    client.mkdir("/t", 0o755).unwrap();
    let stat = client.getattr("/t/").unwrap();
    assert!(stat.is_dir());
}

#[test]
fn test_remove_and_readdir() {
    let cluster = TestCluster::start(1, 1 << 20);
    let client = cluster.client();

    client.mkdir("/d", 0o755).unwrap();
    for i in 0..10 {
        client.mknod(&format!("/d/f{i}"), 0o644).unwrap();
    }

    let mut names = client.readdir("/d").unwrap();
    names.sort();
    assert_eq!(names.len(), 10);
    assert_eq!(names[0], "f0");

    client.remove("/d/f3").unwrap();
    let names = client.readdir("/d").unwrap();
    assert_eq!(names.len(), 9);
    assert!(!names.contains(&"f3".to_string()));
    assert!(matches!(
        client.getattr("/d/f3"),
        Err(FsError::FileNotFound)
    ));

    let (plus_names, infos) = client.readdir_plus("/d").unwrap();
    assert_eq!(plus_names.len(), 9);
    assert_eq!(infos.len(), 9);
    assert!(infos.iter().all(|info| !info.is_dir()));
}

#[test]
fn test_rename() {
    let cluster = TestCluster::start(1, 1 << 20);
    let client = cluster.client();

    client.mkdir("/a", 0o755).unwrap();
    client.mkdir("/b", 0o755).unwrap();
    client.mknod("/a/one", 0o640).unwrap();

    // Same-parent rename is a single server-side operation.
    client.rename("/a/one", "/a/two").unwrap();
    assert!(matches!(
        client.getattr("/a/one"),
        Err(FsError::FileNotFound)
    ));
    let stat = client.getattr("/a/two").unwrap();
    assert_eq!(stat.mode & 0o7777, 0o640);

    // Cross-parent rename degrades to create-entry plus remove.
    client.rename("/a/two", "/b/three").unwrap();
    assert!(matches!(
        client.getattr("/a/two"),
        Err(FsError::FileNotFound)
    ));
    let stat = client.getattr("/b/three").unwrap();
    assert_eq!(stat.mode & 0o7777, 0o640);
}

#[test]
fn test_split_spreads_directory_over_two_servers() {
    const THRESHOLD: i64 = 64;
    const FILES: usize = 150;

    let cluster = TestCluster::start(2, THRESHOLD);
    let client = cluster.client();

    client.mkdir("/big", 0o755).unwrap();
    let dir = client.getattr("/big").unwrap();

    for i in 0..FILES {
        client.mknod(&format!("/big/f{i}"), 0o644).unwrap();
    }

    // Exactly one split is possible under the default policy on two
    // servers: partition 0 into partition 1.
    cluster.wait_for_bit(dir.zeroth_server, dir.inode, 1);

    let raw = cluster.raw();
    let mapping = match raw
        .call(dir.zeroth_server, &Request::ReadBitmap { dir_id: dir.inode })
        .unwrap()
    {
        Reply::Bitmap(wire) => wire.to_mapping().unwrap(),
        other => panic!("unexpected reply {other:?}"),
    };
    assert!(mapping.bit(0));
    assert!(mapping.bit(1));
    assert_eq!(
        mapping.server_for_index(1),
        (1 + dir.zeroth_server) % 2,
        "partition 1 must live next to the zeroth server"
    );

    // The directory is still one multiset: every inserted name is
    // listed exactly once across all partitions.
    let mut names = client.readdir("/big").unwrap();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), FILES);

    // And every name resolves on its owning server after the split.
    for i in 0..FILES {
        let stat = client.getattr(&format!("/big/f{i}")).unwrap();
        assert!(!stat.is_dir());
    }
}

#[test]
fn test_stale_bitmap_gets_redirected() {
    const THRESHOLD: i64 = 32;

    let cluster = TestCluster::start(2, THRESHOLD);
    let client = cluster.client();

    client.mkdir("/spread", 0o755).unwrap();
    let dir = client.getattr("/spread").unwrap();
    for i in 0..(THRESHOLD as usize * 2) {
        client.mknod(&format!("/spread/g{i}"), 0o644).unwrap();
    }
    cluster.wait_for_bit(dir.zeroth_server, dir.inode, 1);

    // A name that addresses partition 1 once the bitmap has two bits.
    let name = (0..10_000)
        .map(|i| format!("stale{i}"))
        .find(|name| index_from_hash(&name_hash(name), 1) == 1)
        .expect("some name hashes into partition 1");

    // A client with a stale single-bit bitmap routes it to the zeroth
    // server, which answers with a redirection carrying both bits.
    let raw = cluster.raw();
    let reply = raw.call(
        dir.zeroth_server,
        &Request::Mknod {
            dir_id: dir.inode,
            name: name.clone(),
            perm: 0o644,
        },
    );
    let wire = match reply {
        Err(FsError::Redirect(wire)) => wire,
        other => panic!("expected a redirection, got {other:?}"),
    };
    let merged = wire.to_mapping().unwrap();
    assert!(merged.bit(1));

    // One merge is enough: the retry lands on the owning server.
    let owner = merged.server_for_name(&name);
    assert_ne!(owner, dir.zeroth_server);
    let reply = raw.call(
        owner,
        &Request::Mknod {
            dir_id: dir.inode,
            name: name.clone(),
            perm: 0o644,
        },
    );
    assert!(matches!(reply, Ok(Reply::Ok)), "retry failed: {reply:?}");
}

#[test]
fn test_embedded_file_round_trip() {
    let cluster = TestCluster::start(1, 1 << 20);
    let client = cluster.client();

    client.mkdir("/data", 0o755).unwrap();
    client.mknod("/data/small", 0o644).unwrap();

    let body = b"hello embedded world".to_vec();
    let fd = client.open("/data/small", OPEN_WRITE).unwrap();
    client.write(fd, 0, &body).unwrap();
    client.close(fd).unwrap();

    let stat = client.getattr("/data/small").unwrap();
    assert_eq!(stat.size, body.len() as i64);

    let fd = client.open("/data/small", OPEN_READ).unwrap();
    let back = client.read(fd, 0, body.len()).unwrap();
    assert_eq!(back, body);
    // Partial read from an offset.
    let tail = client.read(fd, 6, 8).unwrap();
    assert_eq!(tail, b"embedded");
    client.close(fd).unwrap();
}

#[test]
fn test_large_file_spills_to_backing_store() {
    let cluster = TestCluster::start(1, 1 << 20);
    let client = cluster.client();

    client.mkdir("/data", 0o755).unwrap();
    client.mknod("/data/large", 0o644).unwrap();

    let first: Vec<u8> = (0..60_000u32).map(|i| (i % 251) as u8).collect();
    let second: Vec<u8> = (0..10_000u32).map(|i| (i % 13) as u8).collect();

    let fd = client.open("/data/large", OPEN_WRITE).unwrap();
    // Still under the 64 KiB embed threshold.
    client.write(fd, 0, &first).unwrap();
    // This write crosses the threshold and migrates the body out.
    client.write(fd, first.len() as u64, &second).unwrap();
    client.close(fd).unwrap();

    let stat = client.getattr("/data/large").unwrap();
    assert_eq!(stat.size, (first.len() + second.len()) as i64);

    let fd = client.open("/data/large", OPEN_READ).unwrap();
    let back = client.read(fd, 0, first.len() + second.len()).unwrap();
    assert_eq!(back.len(), first.len() + second.len());
    assert_eq!(&back[..first.len()], &first[..]);
    assert_eq!(&back[first.len()..], &second[..]);
    client.close(fd).unwrap();
}

#[test]
fn test_mutation_waits_out_lease() {
    let cluster = TestCluster::start(1, 1 << 20);
    let client = cluster.client();

    client.mkdir("/d", 0o755).unwrap();
    client.mkdir("/d/e", 0o750).unwrap();
    let parent = client.getattr("/d").unwrap();

    // Take a 500ms lease on the entry straight from the server.
    let raw = cluster.raw();
    let granted = match raw
        .call(
            0,
            &Request::Access {
                dir_id: parent.inode,
                name: "e".to_string(),
                lease_time: 500_000,
            },
        )
        .unwrap()
    {
        Reply::Access(grant) => grant,
        other => panic!("unexpected reply {other:?}"),
    };
    assert!(granted.expire_time > 0);

    // The mode change must not complete while the lease is live.
    let started = Instant::now();
    client.chmod("/d/e", 0o700).unwrap();
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(300),
        "chmod returned after only {elapsed:?}"
    );

    let stat = client.getattr("/d/e").unwrap();
    assert_eq!(stat.mode & 0o7777, 0o700);
}

#[test]
fn test_directory_scales_without_duplicates_under_churn() {
    const THRESHOLD: i64 = 32;
    const FILES: usize = 96;

    let cluster = TestCluster::start(2, THRESHOLD);

    client_storm(&cluster, FILES);

    let client = cluster.client();
    let dir = client.getattr("/storm").unwrap();
    cluster.wait_for_bit(dir.zeroth_server, dir.inode, 1);

    let mut names = client.readdir("/storm").unwrap();
    let total = names.len();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), total, "readdir produced duplicate names");
    assert_eq!(names.len(), FILES);
}

/// Several clients hammer one directory concurrently.
fn client_storm(cluster: &TestCluster, files: usize) {
    let client = cluster.client();
    client.mkdir("/storm", 0o755).unwrap();

    let workers = 4;
    let per_worker = files / workers;
    let mut handles = Vec::new();
    for w in 0..workers {
        let config = cluster.config.clone();
        handles.push(std::thread::spawn(move || {
            let client = FsClient::new(&config).expect("client");
            for i in 0..per_worker {
                let path = format!("/storm/w{w}-{i}");
                client.mknod(&path, 0o644).expect("mknod under churn");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("storm worker");
    }
}

#[test]
fn test_same_server_split_rewrites_keys() {
    const THRESHOLD: i64 = 16;
    const FILES: usize = 48;

    // One server with unbounded splitting: the child partition always
    // lands on the parent's server, so the split is pure key motion.
    let cluster = TestCluster::start_with_policy(1, THRESHOLD, SplitPolicy::NoBound);
    let client = cluster.client();

    client.mkdir("/solo", 0o755).unwrap();
    let dir = client.getattr("/solo").unwrap();
    for i in 0..FILES {
        client.mknod(&format!("/solo/s{i}"), 0o644).unwrap();
    }
    cluster.wait_for_bit(dir.zeroth_server, dir.inode, 1);

    // Every entry still resolves: migrated rows must have been re-keyed
    // under the child partition, not just re-addressed.
    for i in 0..FILES {
        let stat = client.getattr(&format!("/solo/s{i}")).unwrap();
        assert!(!stat.is_dir());
    }

    let mut names = client.readdir("/solo").unwrap();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), FILES);
}

#[test]
fn test_readdir_pages_through_large_partitions() {
    // More entries than one scan page (256 rows) in a single partition.
    const FILES: usize = 700;

    let cluster = TestCluster::start(1, 1 << 20);
    let client = cluster.client();

    client.mkdir("/paged", 0o755).unwrap();
    for i in 0..FILES {
        client.mknod(&format!("/paged/p{i}"), 0o644).unwrap();
    }

    let mut names = client.readdir("/paged").unwrap();
    assert_eq!(names.len(), FILES);
    names.sort();
    names.dedup();
    assert_eq!(names.len(), FILES);
}
