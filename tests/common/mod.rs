//! Shared helpers for integration tests.
//!
//! Builds small but valid MP4 files and starts the interception server on a
//! random port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use mediaferry::config::Config;
use mediaferry::server::create_app;

/// Wrap `body` in an atom of type `kind`.
pub fn boxed(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(kind);
    out.extend_from_slice(body);
    out
}

fn full_table(rows: &[&[u32]]) -> Vec<u8> {
    let mut out = vec![0u8; 4];
    out.extend_from_slice(&(rows.len() as u32).to_be_bytes());
    for row in rows {
        for v in *row {
            out.extend_from_slice(&v.to_be_bytes());
        }
    }
    out
}

/// A `moov` with one 640x360 video track whose samples sit in one chunk at
/// `chunk_offset`, one second each, with keyframes at the given 1-based
/// sample numbers.
pub fn build_moov(chunk_offset: u32, sizes: &[u32], keyframes: &[u32]) -> Vec<u8> {
    let n = sizes.len() as u32;

    let mut mvhd = vec![0u8; 12];
    mvhd.extend_from_slice(&1000u32.to_be_bytes());
    mvhd.extend_from_slice(&(n * 1000).to_be_bytes());
    mvhd.extend_from_slice(&[0u8; 80]);

    let mut tkhd = vec![0u8; 12];
    tkhd.extend_from_slice(&1u32.to_be_bytes());
    tkhd.extend_from_slice(&[0u8; 60]);
    tkhd.extend_from_slice(&(640u32 << 16).to_be_bytes());
    tkhd.extend_from_slice(&(360u32 << 16).to_be_bytes());

    let mut mdhd = vec![0u8; 12];
    mdhd.extend_from_slice(&1000u32.to_be_bytes());
    mdhd.extend_from_slice(&(n * 1000).to_be_bytes());
    mdhd.extend_from_slice(&[0u8; 4]);

    let mut hdlr = vec![0u8; 8];
    hdlr.extend_from_slice(b"vide");
    hdlr.extend_from_slice(&[0u8; 13]);

    let mut stsd = vec![0, 0, 0, 0, 0, 0, 0, 1];
    stsd.extend_from_slice(&boxed(b"avc1", &[0u8; 78]));

    let mut stsz = vec![0u8; 8];
    stsz.extend_from_slice(&n.to_be_bytes());
    for s in sizes {
        stsz.extend_from_slice(&s.to_be_bytes());
    }

    let keyframe_rows: Vec<[u32; 1]> = keyframes.iter().map(|k| [*k]).collect();
    let keyframe_refs: Vec<&[u32]> = keyframe_rows.iter().map(|r| r.as_slice()).collect();

    let mut stbl = boxed(b"stsd", &stsd);
    stbl.extend(boxed(b"stts", &full_table(&[&[n, 1000]])));
    stbl.extend(boxed(b"stss", &full_table(&keyframe_refs)));
    stbl.extend(boxed(b"stsc", &full_table(&[&[1, n, 1]])));
    stbl.extend(boxed(b"stsz", &stsz));
    stbl.extend(boxed(b"stco", &full_table(&[&[chunk_offset]])));

    let mut mdia = boxed(b"mdhd", &mdhd);
    mdia.extend(boxed(b"hdlr", &hdlr));
    mdia.extend(boxed(b"minf", &boxed(b"stbl", &stbl)));

    let mut trak = boxed(b"tkhd", &tkhd);
    trak.extend(boxed(b"mdia", &mdia));

    let mut moov = boxed(b"mvhd", &mvhd);
    moov.extend(boxed(b"trak", &trak));
    boxed(b"moov", &moov)
}

/// Sample payload: a position-dependent byte pattern.
pub fn sample_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// `ftyp` + `moov` + `mdat`, `count` samples of `sample_size` bytes,
/// keyframe every other sample.
pub fn faststart_mp4(count: usize, sample_size: u32) -> Vec<u8> {
    let sizes = vec![sample_size; count];
    let keyframes: Vec<u32> = (1..=count as u32).step_by(2).collect();
    let ftyp = boxed(b"ftyp", &[0u8; 16]);

    let moov_len = build_moov(0, &sizes, &keyframes).len();
    let data_start = (ftyp.len() + moov_len + 8) as u32;
    let moov = build_moov(data_start, &sizes, &keyframes);

    let mut file = ftyp;
    file.extend(moov);
    file.extend(boxed(b"mdat", &sample_payload(count * sample_size as usize)));
    file
}

/// `ftyp` + `mdat` + `moov`: the movie header comes after the media data.
pub fn moov_at_end_mp4(count: usize, sample_size: u32) -> Vec<u8> {
    let sizes = vec![sample_size; count];
    let keyframes: Vec<u32> = (1..=count as u32).step_by(2).collect();
    let ftyp = boxed(b"ftyp", &[0u8; 16]);
    let data_start = (ftyp.len() + 8) as u32;

    let mut file = ftyp;
    file.extend(boxed(b"mdat", &sample_payload(count * sample_size as usize)));
    file.extend(build_moov(data_start, &sizes, &keyframes));
    file
}

/// Write `data` to `name` inside `dir`.
pub fn write_fixture(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).expect("failed to write fixture");
    path
}

/// Start the interception server on a random port.
pub async fn start_server(config: Config) -> SocketAddr {
    let app = create_app(&config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind random port");
    let addr = listener.local_addr().expect("failed to get local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    addr
}

/// Serve an arbitrary router on a random port.
pub async fn start_router(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind random port");
    let addr = listener.local_addr().expect("failed to get local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    addr
}
