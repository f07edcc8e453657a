//! Input movies: a start state plus one [`InputFrame`] per simulated frame.
//!
//! File layout:
//! - 0..4  magic `EPMV`
//! - 4..6  format version (u16 LE)
//! - 6..   postcard [`MovieHeader`] followed by the postcard frame vector

use std::fs;
use std::path::{Path, PathBuf};

use emuplay_core::{InputFrame, RomInfo, input::find_gap};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const MOVIE_MAGIC: [u8; 4] = *b"EPMV";
pub const MOVIE_VERSION: u16 = 1;
const PREFIX_LEN: usize = MOVIE_MAGIC.len() + 2;

#[derive(Error, Debug)]
pub enum MovieError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a movie file")]
    BadMagic,

    #[error("unsupported movie version {0}")]
    UnsupportedVersion(u16),

    #[error("malformed movie: {0}")]
    Format(#[from] postcard::Error),

    #[error("frame gap: expected {expected}, found {found}")]
    FrameGap { expected: u64, found: u64 },

    #[error("header declares {declared} frames, file holds {actual}")]
    LengthMismatch { declared: u64, actual: u64 },

    #[error("movie was recorded with a different ROM")]
    RomMismatch,
}

/// State the movie starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovieStart {
    PowerOn,
    /// Snapshot container bytes.
    Snapshot(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovieHeader {
    pub rom_name: String,
    pub rom_hash: Option<[u8; 20]>,
    pub start: MovieStart,
    pub frame_count: u64,
}

impl MovieHeader {
    pub fn new(rom: Option<&RomInfo>, start: MovieStart) -> Self {
        Self {
            rom_name: rom.map(|r| r.name.clone()).unwrap_or_default(),
            rom_hash: rom.map(|r| r.hash),
            start,
            frame_count: 0,
        }
    }

    pub fn check_rom(&self, rom: Option<&RomInfo>) -> Result<(), MovieError> {
        match (self.rom_hash, rom) {
            (Some(ours), Some(rom)) if ours != rom.hash => Err(MovieError::RomMismatch),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Movie {
    pub header: MovieHeader,
    /// Numbered from zero, no gaps.
    pub frames: Vec<InputFrame>,
}

impl Movie {
    pub fn encode(&self) -> Result<Vec<u8>, MovieError> {
        let mut out = Vec::with_capacity(PREFIX_LEN + self.frames.len() * 8);
        out.extend_from_slice(&MOVIE_MAGIC);
        out.extend_from_slice(&MOVIE_VERSION.to_le_bytes());
        let header = MovieHeader {
            frame_count: self.frames.len() as u64,
            ..self.header.clone()
        };
        out.extend(postcard::to_stdvec(&header)?);
        out.extend(postcard::to_stdvec(&self.frames)?);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MovieError> {
        if bytes.len() < PREFIX_LEN || bytes[0..4] != MOVIE_MAGIC {
            return Err(MovieError::BadMagic);
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != MOVIE_VERSION {
            return Err(MovieError::UnsupportedVersion(version));
        }
        let (header, rest): (MovieHeader, _) = postcard::take_from_bytes(&bytes[PREFIX_LEN..])?;
        let frames: Vec<InputFrame> = postcard::from_bytes(rest)?;
        if header.frame_count != frames.len() as u64 {
            return Err(MovieError::LengthMismatch {
                declared: header.frame_count,
                actual: frames.len() as u64,
            });
        }
        if let Some((expected, found)) = find_gap(&frames, 0) {
            return Err(MovieError::FrameGap { expected, found });
        }
        Ok(Self { header, frames })
    }

    pub fn save(&self, path: &Path) -> Result<(), MovieError> {
        fs::write(path, self.encode()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, MovieError> {
        Self::decode(&fs::read(path)?)
    }
}

/// Appends frames while recording; written out by [`MovieRecorder::finish`].
#[derive(Debug)]
pub struct MovieRecorder {
    path: PathBuf,
    movie: Movie,
}

impl MovieRecorder {
    pub fn new(path: impl Into<PathBuf>, header: MovieHeader) -> Self {
        Self {
            path: path.into(),
            movie: Movie {
                header,
                frames: Vec::new(),
            },
        }
    }

    /// Record the input of one simulated frame. The stored counter is the
    /// frame's position in the movie.
    pub fn push(&mut self, input: InputFrame) {
        let frame = self.movie.frames.len() as u64;
        self.movie.frames.push(InputFrame { frame, ..input });
    }

    pub fn len(&self) -> usize {
        self.movie.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.movie.frames.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(self) -> Result<Movie, MovieError> {
        self.movie.save(&self.path)?;
        info!(path = %self.path.display(), frames = self.movie.frames.len(), "movie written");
        Ok(self.movie)
    }
}

/// Hands out a loaded movie's frames in order.
#[derive(Debug)]
pub struct MoviePlayer {
    movie: Movie,
    pos: usize,
}

impl MoviePlayer {
    pub fn new(movie: Movie) -> Self {
        Self { movie, pos: 0 }
    }

    pub fn header(&self) -> &MovieHeader {
        &self.movie.header
    }

    pub fn len(&self) -> usize {
        self.movie.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.movie.frames.is_empty()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.len() - self.pos
    }

    pub fn is_finished(&self) -> bool {
        self.pos >= self.len()
    }
}

impl Iterator for MoviePlayer {
    type Item = InputFrame;

    fn next(&mut self) -> Option<InputFrame> {
        let frame = self.movie.frames.get(self.pos).copied()?;
        self.pos += 1;
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use emuplay_core::FrameFlags;
    use proptest::prelude::*;

    use super::*;

    fn sample(frames: u64) -> Movie {
        let rom = RomInfo::from_image("demo.nes", b"demo");
        let mut rec = MovieRecorder::new("unused.epm", MovieHeader::new(Some(&rom), MovieStart::PowerOn));
        for i in 0..frames {
            rec.push(InputFrame::new(1000 + i, [i as u8, 0, 0, 0]));
        }
        rec.movie
    }

    #[test]
    fn recorder_numbers_frames_from_zero() {
        let movie = sample(3);
        let counters: Vec<u64> = movie.frames.iter().map(|f| f.frame).collect();
        assert_eq!(counters, vec![0, 1, 2]);
    }

    #[test]
    fn decode_restores_header_and_frames() {
        let mut movie = sample(4);
        movie.frames[2].commands = FrameFlags::RESET;
        let decoded = Movie::decode(&movie.encode().unwrap()).unwrap();
        assert_eq!(decoded.header.frame_count, 4);
        assert_eq!(decoded.header.rom_name, "demo");
        assert_eq!(decoded.frames, movie.frames);
    }

    #[test]
    fn rejects_wrong_magic_and_version() {
        let bytes = sample(1).encode().unwrap();
        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(Movie::decode(&bad_magic), Err(MovieError::BadMagic)));

        let mut bad_version = bytes;
        bad_version[4] = 9;
        assert!(matches!(
            Movie::decode(&bad_version),
            Err(MovieError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn gap_in_counters_is_corruption() {
        let mut movie = sample(3);
        movie.frames[2].frame = 5;
        assert!(matches!(
            Movie::decode(&movie.encode().unwrap()),
            Err(MovieError::FrameGap { expected: 2, found: 5 })
        ));
    }

    #[test]
    fn rom_check_only_fails_on_known_mismatch() {
        let header = sample(0).header;
        assert!(header.check_rom(None).is_ok());
        assert!(header.check_rom(Some(&RomInfo::from_image("x.nes", b"demo"))).is_ok());
        assert!(matches!(
            header.check_rom(Some(&RomInfo::from_image("x.nes", b"other"))),
            Err(MovieError::RomMismatch)
        ));
    }

    #[test]
    fn player_yields_each_frame_once() {
        let mut player = MoviePlayer::new(sample(3));
        assert_eq!(player.remaining(), 3);
        assert_eq!(player.next().map(|f| f.ports[0]), Some(0));
        assert_eq!(player.next().map(|f| f.ports[0]), Some(1));
        assert_eq!(player.next().map(|f| f.ports[0]), Some(2));
        assert!(player.is_finished());
        assert_eq!(player.next(), None);
    }

    proptest! {
        #[test]
        fn truncated_files_never_decode(len in 0usize..64, frames in 0u64..8) {
            let bytes = sample(frames).encode().unwrap();
            let cut = len.min(bytes.len().saturating_sub(1));
            prop_assert!(Movie::decode(&bytes[..cut]).is_err());
        }
    }
}
