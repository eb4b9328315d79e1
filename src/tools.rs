//! External encoder/decoder subprocesses behind the `AudioEncoder` and
//! `AudioDecoder` seams.

use crate::error::{PatchError, Result};
use log::{debug, info, warn};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_QUALITY: u8 = 10;

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs `program` to completion, killing it after `timeout`.
pub fn run_tool(program: &Path, args: &[String], timeout: Duration) -> Result<ToolOutput> {
    let name = program.display().to_string();
    debug!("run: {} {}", name, args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PatchError::NotFound(format!("tool {}", name)),
            _ => PatchError::tool(&name, format!("failed to start: {}", e)),
        })?;

    // Drain pipes on threads so a chatty tool cannot block on a full pipe.
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= timeout {
            warn!("{} exceeded {:?}, killing", name, timeout);
            let _ = child.kill();
            let _ = child.wait();
            return Err(PatchError::tool(&name, format!("timed out after {:?}", timeout)));
        }
        thread::sleep(Duration::from_millis(20));
    };

    let output = ToolOutput {
        stdout: stdout.map(join_drain).unwrap_or_default(),
        stderr: stderr.map(join_drain).unwrap_or_default(),
    };
    if !status.success() {
        return Err(PatchError::tool(
            &name,
            format!("exited with {}: {}", status, output.stderr.trim()),
        ));
    }
    Ok(output)
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = pipe.read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn join_drain(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

/// Loop points handed to the Vorbis encoder as comments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderLoop {
    pub start: u64,
    pub end: u64,
}

/// Produces codec bitstreams from a WAV.
pub trait AudioEncoder {
    /// Returns a complete Ogg Vorbis file.
    fn encode_vorbis(&self, wav: &Path, loop_points: Option<EncoderLoop>) -> Result<Vec<u8>>;

    /// Returns a RIFF/WAVE file holding MS-ADPCM.
    fn encode_adpcm(&self, wav: &Path) -> Result<Vec<u8>>;
}

/// What a full-container decode reported on stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderReport {
    pub sample_rate: Option<u32>,
    pub loop_start: Option<u64>,
    pub loop_end: Option<u64>,
    pub total_samples: Option<u64>,
}

impl DecoderReport {
    pub fn parse(stdout: &str) -> Self {
        let mut report = Self::default();
        for line in stdout.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let number = value
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<u64>().ok());
            match key.trim().to_ascii_lowercase().as_str() {
                "sample rate" => report.sample_rate = number.map(|n| n as u32),
                "loop start" => report.loop_start = number,
                "loop end" => report.loop_end = number,
                "stream total samples" => report.total_samples = number,
                _ => {}
            }
        }
        report
    }
}

/// Turns encoded audio back into PCM WAV.
pub trait AudioDecoder {
    /// Decodes an Ogg file. `Ok(false)` means no Ogg decoder is available.
    fn decode_ogg(&self, ogg: &Path, wav: &Path) -> Result<bool>;

    /// Decodes a whole container. `Ok(None)` means no container decoder is available.
    fn decode_container(&self, container: &Path, wav: &Path) -> Result<Option<DecoderReport>>;

    /// Every tool location considered, for error messages.
    fn searched_paths(&self) -> Vec<PathBuf>;
}

/// Paths and settings for the external tools.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub vorbis_encoder: PathBuf,
    pub adpcm_encoder: PathBuf,
    /// Tried in order; `oggdec`-style or `ffmpeg`-style by file name.
    pub ogg_decoders: Vec<PathBuf>,
    pub container_decoder: PathBuf,
    pub quality: u8,
    pub timeout: Duration,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self::in_dir(Path::new("tools"))
    }
}

impl Toolchain {
    /// The conventional layout: every tool beside each other in `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            vorbis_encoder: dir.join(exe("oggenc")),
            adpcm_encoder: dir.join(exe("adpcmencode3")),
            ogg_decoders: vec![dir.join(exe("oggdec")), dir.join(exe("ffmpeg"))],
            container_decoder: dir.join(exe("vgmstream-cli")),
            quality: DEFAULT_QUALITY,
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    fn require(path: &Path) -> Result<()> {
        if path.is_file() {
            Ok(())
        } else {
            Err(PatchError::NotFound(format!("tool {}", path.display())))
        }
    }
}

fn exe(name: &str) -> String {
    format!("{}{}", name, std::env::consts::EXE_SUFFIX)
}

fn arg(path: &Path) -> String {
    path.display().to_string()
}

impl AudioEncoder for Toolchain {
    fn encode_vorbis(&self, wav: &Path, loop_points: Option<EncoderLoop>) -> Result<Vec<u8>> {
        Self::require(&self.vorbis_encoder)?;
        let mut args = vec![
            arg(wav),
            "-s".to_string(),
            "0".to_string(),
            "-q".to_string(),
            self.quality.to_string(),
        ];
        if let Some(points) = loop_points {
            args.extend([
                "-c".to_string(),
                format!("LoopStart={}", points.start),
                "-c".to_string(),
                format!("LoopEnd={}", points.end),
            ]);
        }
        run_tool(&self.vorbis_encoder, &args, self.timeout)?;

        let ogg = wav.with_extension("ogg");
        let data = fs::read(&ogg).map_err(|e| {
            PatchError::tool(arg(&self.vorbis_encoder), format!("no output {}: {}", ogg.display(), e))
        })?;
        info!("Encoded {} -> {} bytes of Vorbis", wav.display(), data.len());
        Ok(data)
    }

    fn encode_adpcm(&self, wav: &Path) -> Result<Vec<u8>> {
        Self::require(&self.adpcm_encoder)?;
        let output = wav.with_extension("adpcm.wav");
        run_tool(&self.adpcm_encoder, &[arg(wav), arg(&output)], self.timeout)?;
        let data = fs::read(&output).map_err(|e| {
            PatchError::tool(arg(&self.adpcm_encoder), format!("no output {}: {}", output.display(), e))
        })?;
        info!("Encoded {} -> {} bytes of MS-ADPCM", wav.display(), data.len());
        Ok(data)
    }
}

impl AudioDecoder for Toolchain {
    fn decode_ogg(&self, ogg: &Path, wav: &Path) -> Result<bool> {
        let Some(decoder) = self.ogg_decoders.iter().find(|p| p.is_file()) else {
            return Ok(false);
        };
        let is_ffmpeg = decoder
            .file_stem()
            .is_some_and(|stem| stem.to_string_lossy().contains("ffmpeg"));
        let args = if is_ffmpeg {
            vec![
                "-y".to_string(),
                "-i".to_string(),
                arg(ogg),
                "-c:a".to_string(),
                "pcm_s16le".to_string(),
                arg(wav),
            ]
        } else {
            vec![arg(ogg), "-o".to_string(), arg(wav)]
        };
        run_tool(decoder, &args, self.timeout)?;
        Ok(true)
    }

    fn decode_container(&self, container: &Path, wav: &Path) -> Result<Option<DecoderReport>> {
        if !self.container_decoder.is_file() {
            return Ok(None);
        }
        let args = ["-E", "-l", "1", "-f", "0", "-o"]
            .iter()
            .map(|s| s.to_string())
            .chain([arg(wav), arg(container)])
            .collect::<Vec<_>>();
        let output = run_tool(&self.container_decoder, &args, self.timeout)?;
        Ok(Some(DecoderReport::parse(&output.stdout)))
    }

    fn searched_paths(&self) -> Vec<PathBuf> {
        self.ogg_decoders
            .iter()
            .cloned()
            .chain(std::iter::once(self.container_decoder.clone()))
            .collect()
    }
}
