//! End-to-end engine scenarios against a scripted in-memory server.
//!
//! The server end speaks the real framed protocol over a duplex pipe and
//! keeps its remote store in a plain map, which the tests inspect after
//! the engine finishes.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Error};
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

use ctvault::config::{Config, CtfileMode};
use ctvault::ctfile::{self, CtfileWriter, MatchMode};
use ctvault::engine::{DataOps, Engine, SecretsCrypto, MAX_BLOCK_SIZE};
use ctvault::protocol::{
    CtrlMsg, CtrlReply, Frame, FrameCodec, FrameHeader, HeaderFlags, ListedFile, Opcode,
    STATUS_FAIL,
};

#[derive(Default)]
struct ServerState {
    files: HashMap<String, Vec<u8>>,
    write_chunks: usize,
    setup_uuids: Vec<u64>,
    sha_batches: Vec<(u64, Vec<[u8; 20]>)>,
    complete_uuids: Vec<u64>,
}

async fn run_server(io: DuplexStream, mut state: ServerState) -> ServerState {
    let mut framed = Framed::new(io, FrameCodec::new());
    // (name, opened-for-write, accumulated bytes)
    let mut open: Option<(String, bool, Vec<u8>)> = None;

    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(_) => break,
        };
        let tag = frame.header.tag;

        match frame.header.opcode {
            Opcode::Xml => {
                let reply = match CtrlMsg::parse(&frame.body).unwrap() {
                    CtrlMsg::MdOpenCreate { name, .. } => {
                        open = Some((name.clone(), true, Vec::new()));
                        CtrlReply::Opened { name: Some(name) }
                    }
                    CtrlMsg::MdOpenRead { name, .. } => {
                        if state.files.contains_key(&name) {
                            open = Some((name.clone(), false, Vec::new()));
                            CtrlReply::Opened { name: Some(name) }
                        } else {
                            CtrlReply::Opened { name: None }
                        }
                    }
                    CtrlMsg::MdClose => {
                        if let Some((name, write, buf)) = open.take() {
                            if write {
                                state.files.insert(name, buf);
                            }
                        }
                        CtrlReply::Closed
                    }
                    CtrlMsg::MdList => {
                        let mut files: Vec<ListedFile> = state
                            .files
                            .iter()
                            .map(|(name, bytes)| ListedFile {
                                name: name.clone(),
                                size: bytes.len() as u64,
                                mtime: 0,
                            })
                            .collect();
                        files.sort_by(|a, b| a.name.cmp(&b.name));
                        CtrlReply::List { files }
                    }
                    CtrlMsg::MdDelete { name } => match state.files.remove(&name) {
                        Some(_) => CtrlReply::Deleted { name: Some(name) },
                        None => CtrlReply::Deleted { name: None },
                    },
                    CtrlMsg::CullSetup { uuid } => {
                        state.setup_uuids.push(uuid);
                        CtrlReply::CullSetupOk
                    }
                    CtrlMsg::CullShas { uuid, shas } => {
                        state.sha_batches.push((uuid, shas));
                        CtrlReply::CullShasOk
                    }
                    CtrlMsg::CullComplete { uuid } => {
                        state.complete_uuids.push(uuid);
                        CtrlReply::CullCompleteOk
                    }
                };
                let header = FrameHeader::new(Opcode::XmlReply, HeaderFlags::METADATA, tag);
                framed
                    .send(Frame::new(header, reply.render().into()))
                    .await
                    .unwrap();
            }
            Opcode::Data => {
                if let Some((_, true, ref mut buf)) = open {
                    // body is sha + iv + chunk bytes
                    buf.extend_from_slice(&frame.body[36..]);
                }
                state.write_chunks += 1;
                let header = FrameHeader::new(Opcode::Data, HeaderFlags::METADATA, tag);
                framed
                    .send(Frame::new(header, bytes::Bytes::new()))
                    .await
                    .unwrap();
            }
            Opcode::Read => {
                let chunk_no = u32::from_le_bytes([
                    frame.body[0],
                    frame.body[1],
                    frame.body[2],
                    frame.body[3],
                ]) as usize;

                let mut header = FrameHeader::new(Opcode::Read, HeaderFlags::METADATA, tag);
                let body = match open {
                    Some((ref name, false, _)) => {
                        let bytes = &state.files[name];
                        let start = chunk_no * MAX_BLOCK_SIZE;
                        if start >= bytes.len() {
                            header.status = STATUS_FAIL;
                            bytes::Bytes::new()
                        } else {
                            let end = (start + MAX_BLOCK_SIZE).min(bytes.len());
                            bytes::Bytes::copy_from_slice(&bytes[start..end])
                        }
                    }
                    _ => {
                        header.status = STATUS_FAIL;
                        bytes::Bytes::new()
                    }
                };
                framed.send(Frame::new(header, body)).await.unwrap();
            }
            Opcode::XmlReply => {}
        }
    }
    state
}

fn test_config(cachedir: &Path) -> Config {
    let mut config = Config::default();
    config.ctfile_mode = CtfileMode::Remote;
    config.ctfile_cachedir = Some(format!("{}/", cachedir.display()));
    config.queue_depth = 8;
    config
}

/// Render a ctfile into bytes without leaving it on disk.
fn ctfile_bytes(scratch: &Path, previous: Option<&str>, shas: &[[u8; 20]]) -> Vec<u8> {
    let path = scratch.join("scratch.ct");
    let mut writer = CtfileWriter::create(&path, previous).unwrap();
    writer.append_metadata(b"directory metadata").unwrap();
    for sha in shas {
        writer.append_sha(sha).unwrap();
    }
    writer.finish().unwrap();
    let bytes = std::fs::read(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    bytes
}

fn set_mtime(path: &Path, secs: i64) {
    use nix::sys::time::{TimeVal, TimeValLike};
    let stamp = TimeVal::seconds(secs);
    nix::sys::stat::utimes(path, &stamp, &stamp).unwrap();
}

/// Data plane stand-in: "archiving" writes a deterministic multi-chunk
/// catalogue file.
struct FakeData {
    content_shas: Vec<[u8; 20]>,
}

impl DataOps for FakeData {
    fn archive(
        &mut self,
        ctfile: &Path,
        _filelist: &[String],
        _excludelist: &[String],
        basis: Option<&Path>,
    ) -> Result<(), Error> {
        let previous = basis.and_then(|p| p.file_name()).and_then(|n| n.to_str());
        let mut writer = CtfileWriter::create(ctfile, previous)?;
        let blob: Vec<u8> = (0..300 * 1024).map(|i| (i % 251) as u8).collect();
        writer.append_metadata(&blob)?;
        for sha in &self.content_shas {
            writer.append_sha(sha)?;
        }
        writer.finish()
    }

    fn extract(
        &mut self,
        _ctfile: &Path,
        _filelist: &[String],
        _excludelist: &[String],
    ) -> Result<(), Error> {
        Ok(())
    }

    fn list(
        &mut self,
        _ctfile: &Path,
        _filelist: &[String],
        _excludelist: &[String],
        _matchmode: MatchMode,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Secrets stand-in: a file "unlocks" when its contents match.
struct ContentSecrets {
    accept: Vec<u8>,
}

impl SecretsCrypto for ContentSecrets {
    fn unlock(&mut self, path: &Path, _passphrase: &str) -> Result<(), Error> {
        if std::fs::read(path)? == self.accept {
            Ok(())
        } else {
            bail!("wrong passphrase");
        }
    }

    fn create(&mut self, path: &Path, _passphrase: &str) -> Result<(), Error> {
        std::fs::write(path, &self.accept)?;
        Ok(())
    }
}

#[tokio::test]
async fn fresh_archive_uploads_ctfile() {
    let cache = tempfile::tempdir().unwrap();
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let server = tokio::spawn(run_server(server_io, ServerState::default()));

    let mut engine = Engine::new(client_io, test_config(cache.path()))
        .unwrap()
        .with_data_ops(Box::new(FakeData {
            content_shas: vec![[0x11; 20], [0x22; 20]],
        }));

    engine
        .queue_archive("photos", Vec::new(), Vec::new(), MatchMode::Glob, None)
        .unwrap();
    engine.run().await.unwrap();

    drop(engine);
    let state = server.await.unwrap();

    assert_eq!(state.files.len(), 1);
    let (name, remote_bytes) = state.files.iter().next().unwrap();
    assert!(ctfile::is_fullname(name));
    assert!(name.ends_with("-photos"));

    // the cache entry and the remote copy are byte-identical
    let local = std::fs::read(cache.path().join(name)).unwrap();
    assert_eq!(&local, remote_bytes);

    // one data transaction per max-size block
    let expected = (local.len() + MAX_BLOCK_SIZE - 1) / MAX_BLOCK_SIZE;
    assert_eq!(state.write_chunks, expected);
}

#[tokio::test]
async fn rejected_tag_issues_no_traffic() {
    let cache = tempfile::tempdir().unwrap();
    let (client_io, _server_io) = tokio::io::duplex(4096);

    let mut engine = Engine::new(client_io, test_config(cache.path())).unwrap();
    assert!(engine
        .queue_archive("pho/tos", Vec::new(), Vec::new(), MatchMode::Glob, None)
        .is_err());
    assert!(engine
        .queue_archive("pho|tos", Vec::new(), Vec::new(), MatchMode::Glob, None)
        .is_err());

    // nothing was queued, so the run is a no-op
    engine.run().await.unwrap();
}

#[tokio::test]
async fn fetch_resolves_differential_chain() {
    let cache = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();

    let mut state = ServerState::default();
    state.files.insert(
        "20240215-000000-weekly".to_string(),
        ctfile_bytes(scratch.path(), None, &[[0xaa; 20]]),
    );
    state.files.insert(
        "20240222-000000-weekly".to_string(),
        ctfile_bytes(scratch.path(), Some("20240215-000000-weekly"), &[[0xbb; 20]]),
    );
    state.files.insert(
        "20240301-000000-weekly".to_string(),
        ctfile_bytes(scratch.path(), Some("20240222-000000-weekly"), &[[0xcc; 20]]),
    );
    let expected = state.files.clone();

    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let server = tokio::spawn(run_server(server_io, state));

    let mut engine = Engine::new(client_io, test_config(cache.path())).unwrap();
    engine.queue_fetch("weekly").unwrap();
    engine.run().await.unwrap();

    assert_eq!(
        engine.fetched().unwrap(),
        cache.path().join("20240301-000000-weekly")
    );

    // the whole chain landed in the cache, byte for byte
    for (name, bytes) in expected {
        assert_eq!(std::fs::read(cache.path().join(&name)).unwrap(), bytes);
    }

    drop(engine);
    server.await.unwrap();
}

#[tokio::test]
async fn push_then_fetch_round_trips() {
    let cache = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();

    // a catalogue file spanning several chunks
    let src = scratch.path().join("backup.ct");
    let mut writer = CtfileWriter::create(&src, None).unwrap();
    let blob: Vec<u8> = (0..600 * 1024).map(|i| (i % 241) as u8).collect();
    writer.append_metadata(&blob).unwrap();
    writer.append_sha(&[0x42; 20]).unwrap();
    writer.finish().unwrap();

    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let server = tokio::spawn(run_server(server_io, ServerState::default()));

    let mut engine = Engine::new(client_io, test_config(cache.path())).unwrap();
    engine.queue_ctfile_push(src.clone(), "roundtrip").unwrap();
    engine.queue_fetch("roundtrip").unwrap();
    engine.run().await.unwrap();

    let fetched = engine.fetched().unwrap().to_path_buf();
    assert_eq!(
        std::fs::read(&src).unwrap(),
        std::fs::read(&fetched).unwrap()
    );

    drop(engine);
    server.await.unwrap();
}

#[tokio::test]
async fn cull_expires_and_declares_precious() {
    let cache = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let now = chrono::Local::now();
    let dated = |days: i64, tag: &str| {
        format!(
            "{}-{}",
            (now - chrono::Duration::days(days)).format("%Y%m%d-%H%M%S"),
            tag
        )
    };

    let name_a = dated(10, "daily");
    let name_b = dated(40, "daily");
    let name_c = dated(50, "other");

    let a_shas = [[0x0a; 20], [0x1a; 20]];
    let mut state = ServerState::default();
    state
        .files
        .insert(name_a.clone(), ctfile_bytes(scratch.path(), None, &a_shas));
    state.files.insert(
        name_b.clone(),
        ctfile_bytes(scratch.path(), Some(&name_a), &[[0x0b; 20]]),
    );
    state
        .files
        .insert(name_c.clone(), ctfile_bytes(scratch.path(), None, &[[0x0c; 20]]));

    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let server = tokio::spawn(run_server(server_io, state));

    let mut config = test_config(cache.path());
    config.ctfile_cull_keep_days = 30;
    let mut engine = Engine::new(client_io, config).unwrap();
    engine.queue_cull().unwrap();
    engine.run().await.unwrap();

    drop(engine);
    let state = server.await.unwrap();

    // only the recent file survives; its chunk hashes are the precious set
    assert!(state.files.contains_key(&name_a));
    assert!(!state.files.contains_key(&name_b));
    assert!(!state.files.contains_key(&name_c));

    assert_eq!(state.setup_uuids.len(), 1);
    let uuid = state.setup_uuids[0];
    assert_eq!(state.complete_uuids, vec![uuid]);

    let mut precious = Vec::new();
    for (batch_uuid, shas) in &state.sha_batches {
        assert_eq!(*batch_uuid, uuid);
        precious.extend_from_slice(shas);
    }
    precious.sort();
    let mut expected = a_shas.to_vec();
    expected.sort();
    assert_eq!(precious, expected);
}

#[tokio::test]
async fn secrets_sync_adopts_newer_remote() {
    let cache = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    let secrets_path = home.path().join("crypto.secrets");
    std::fs::write(&secrets_path, b"oldsecrets").unwrap();
    set_mtime(&secrets_path, 1000);

    let mut state = ServerState::default();
    state.files.insert(
        "00000000000000002000-crypto.secrets".to_string(),
        b"newsecrets".to_vec(),
    );

    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let server = tokio::spawn(run_server(server_io, state));

    let mut config = test_config(cache.path());
    config.upload_crypto_secrets = true;
    config.crypto_secrets = Some(secrets_path.clone());
    config.crypto_passphrase = Some("hunter2hunter2".to_string());

    let mut engine = Engine::new(client_io, config).unwrap().with_secrets(Box::new(
        ContentSecrets {
            accept: b"newsecrets".to_vec(),
        },
    ));
    engine.queue_secrets_sync().unwrap();
    engine.run().await.unwrap();

    // downloaded file adopted, server mtime stamped on, old copy kept
    assert_eq!(std::fs::read(&secrets_path).unwrap(), b"newsecrets");
    use std::os::unix::fs::MetadataExt;
    assert_eq!(std::fs::metadata(&secrets_path).unwrap().mtime(), 2000);
    let bak = home.path().join("crypto.secrets.bak");
    assert_eq!(std::fs::read(&bak).unwrap(), b"oldsecrets");

    drop(engine);
    server.await.unwrap();
}

#[tokio::test]
async fn secrets_sync_falls_back_when_unlock_fails() {
    let cache = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    let secrets_path = home.path().join("crypto.secrets");
    std::fs::write(&secrets_path, b"oldsecrets").unwrap();
    set_mtime(&secrets_path, 1000);

    let mut state = ServerState::default();
    state.files.insert(
        "00000000000000002000-crypto.secrets".to_string(),
        b"garbagegarbage".to_vec(),
    );

    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let server = tokio::spawn(run_server(server_io, state));

    let mut config = test_config(cache.path());
    config.upload_crypto_secrets = true;
    config.crypto_secrets = Some(secrets_path.clone());
    config.crypto_passphrase = Some("hunter2hunter2".to_string());

    // only the old contents unlock
    let mut engine = Engine::new(client_io, config).unwrap().with_secrets(Box::new(
        ContentSecrets {
            accept: b"oldsecrets".to_vec(),
        },
    ));
    engine.queue_secrets_sync().unwrap();
    engine.run().await.unwrap();

    // local file untouched, tmp file cleaned up
    assert_eq!(std::fs::read(&secrets_path).unwrap(), b"oldsecrets");
    use std::os::unix::fs::MetadataExt;
    assert_eq!(std::fs::metadata(&secrets_path).unwrap().mtime(), 1000);
    for entry in std::fs::read_dir(home.path()).unwrap() {
        let name = entry.unwrap().file_name();
        assert!(
            !name.to_string_lossy().starts_with(".ctcrypto."),
            "stale tmp file {:?}",
            name
        );
    }

    drop(engine);
    server.await.unwrap();
}

#[tokio::test]
async fn secrets_sync_uploads_newer_local() {
    let cache = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    let secrets_path = home.path().join("crypto.secrets");
    std::fs::write(&secrets_path, b"oldsecrets").unwrap();
    set_mtime(&secrets_path, 3000);

    let mut state = ServerState::default();
    state.files.insert(
        "00000000000000002000-crypto.secrets".to_string(),
        b"newsecrets".to_vec(),
    );

    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let server = tokio::spawn(run_server(server_io, state));

    let mut config = test_config(cache.path());
    config.upload_crypto_secrets = true;
    config.crypto_secrets = Some(secrets_path.clone());
    config.crypto_passphrase = Some("hunter2hunter2".to_string());

    let mut engine = Engine::new(client_io, config).unwrap().with_secrets(Box::new(
        ContentSecrets {
            accept: b"oldsecrets".to_vec(),
        },
    ));
    engine.queue_secrets_sync().unwrap();
    engine.run().await.unwrap();

    drop(engine);
    let state = server.await.unwrap();

    let uploaded = state
        .files
        .get("00000000000000003000-crypto.secrets")
        .expect("local secrets file was not uploaded");
    assert_eq!(uploaded, b"oldsecrets");
    assert_eq!(std::fs::read(&secrets_path).unwrap(), b"oldsecrets");
}
