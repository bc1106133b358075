//! Test support library
//! Provides NIfTI fixtures, a scripted predictor and a loopback receiver.
#![allow(dead_code)]

use std::fs;
use std::io::Read;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ndarray::Array3;
use nifti::NiftiHeader;
use nifti::writer::WriterOptions;
use segviz::{Predictor, PredictorError};

/// Write `labels` (indexed `[x, y, z]`) as a NIfTI-1 file with `uint8`
/// voxels. A `.nii.gz` path is written gzip-compressed.
pub fn write_nifti(path: &Path, labels: &Array3<u8>, spacing: [f32; 3]) {
    let header = NiftiHeader {
        pixdim: [1.0, spacing[0], spacing[1], spacing[2], 1.0, 1.0, 1.0, 1.0],
        ..NiftiHeader::default()
    };
    WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(labels)
        .unwrap();
}

/// 6x6x6 volume: a 3x3x3 liver block (label 8) and two single-voxel tumors
/// (label 9) that do not touch.
pub fn liver_with_two_tumors() -> Array3<u8> {
    let mut labels = Array3::<u8>::zeros((6, 6, 6));
    labels.slice_mut(ndarray::s![0..3, 0..3, 0..3]).fill(8);
    labels[[5, 0, 5]] = 9;
    labels[[5, 5, 5]] = 9;
    labels
}

/// Predictor that copies a prepared label volume to the requested output.
#[derive(Clone)]
pub struct CopyPredictor {
    source: PathBuf,
    calls: Arc<AtomicUsize>,
}

impl CopyPredictor {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Predictor for CopyPredictor {
    fn predict(&self, _input: &Path, output_hint: &Path) -> Result<PathBuf, PredictorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(parent) = output_hint.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&self.source, output_hint)?;
        Ok(output_hint.to_path_buf())
    }
}

/// Accept one connection on an ephemeral loopback port and return
/// everything the peer sent.
pub fn receiver() -> (u16, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).unwrap();
        received
    });
    (port, handle)
}

/// Start listening on `port` only after `delay`, then behave like
/// [`receiver`].
pub fn late_receiver(port: u16, delay: Duration) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        thread::sleep(delay);
        let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
        let (mut stream, _) = listener.accept().unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).unwrap();
        received
    })
}

/// A loopback port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Decoded delivery stream.
#[derive(Debug)]
pub struct Received {
    pub payload: serde_json::Value,
    pub meshes: Vec<(u32, Vec<u8>)>,
}

pub fn decode(bytes: &[u8]) -> Received {
    let mut at = 0;
    let next_u32 = |at: &mut usize| {
        let v = u32::from_be_bytes(bytes[*at..*at + 4].try_into().unwrap());
        *at += 4;
        v
    };
    let len = next_u32(&mut at) as usize;
    let payload = serde_json::from_slice(&bytes[at..at + len]).unwrap();
    at += len;
    let count = next_u32(&mut at);
    let mut meshes = Vec::new();
    for _ in 0..count {
        let label = next_u32(&mut at);
        let len = next_u32(&mut at) as usize;
        meshes.push((label, bytes[at..at + len].to_vec()));
        at += len;
    }
    assert_eq!(at, bytes.len(), "trailing bytes after last mesh");
    Received { payload, meshes }
}
