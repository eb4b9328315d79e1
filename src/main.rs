use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use hed_patch::scd::ScdFile;
use hed_patch::{
    Archive, ArchivePair, ArchivePatchEngine, BuildOptions, CipherParams, ContainerBuilder,
    ContainerExtractor, EgsCodec, EntryOutcome, NameTable, PatchOptions, PatchTree, Toolchain,
};
use log::{info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ArchiveArgs {
    /// Index (.hed) or blob (.pkg) file; the other is found beside it
    input: PathBuf,
    /// Known asset names, one per line
    #[arg(short, long)]
    names: Option<PathBuf>,
    /// Cipher passes per key
    #[arg(long, default_value_t = hed_patch::cipher::DEFAULT_PASS_COUNT)]
    passes: u32,
    /// Leading payload bytes covered by the cipher
    #[arg(long, default_value_t = hed_patch::cipher::DEFAULT_WINDOW)]
    window: usize,
}

impl ArchiveArgs {
    fn pair(&self) -> ArchivePair {
        ArchivePair::from_path(&self.input)
    }

    fn names(&self) -> Result<NameTable> {
        match &self.names {
            Some(path) => Ok(NameTable::load(path)?),
            None => Ok(NameTable::new()),
        }
    }

    fn cipher(&self) -> CipherParams {
        CipherParams {
            pass_count: self.passes,
            window: self.window,
        }
    }
}

#[derive(Args)]
struct ToolArgs {
    /// Directory holding oggenc, adpcmencode3, oggdec/ffmpeg and vgmstream-cli
    #[arg(long, default_value = "tools")]
    tools: PathBuf,
    /// Vorbis encoder quality
    #[arg(short, long, default_value_t = hed_patch::tools::DEFAULT_QUALITY)]
    quality: u8,
    /// Seconds before an external tool is killed
    #[arg(long, default_value_t = hed_patch::tools::DEFAULT_TOOL_TIMEOUT.as_secs())]
    tool_timeout: u64,
}

impl ToolArgs {
    fn toolchain(&self) -> Toolchain {
        Toolchain {
            quality: self.quality,
            timeout: Duration::from_secs(self.tool_timeout),
            ..Toolchain::in_dir(&self.tools)
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List every entry of an archive
    List {
        #[command(flatten)]
        archive: ArchiveArgs,
    },
    /// Decode one asset (or all) from an archive
    Unpack {
        #[command(flatten)]
        archive: ArchiveArgs,
        /// Asset name to unpack (or "all")
        target: String,
        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
    /// Apply a patch tree (original/, raw/, remastered/) to an archive
    Patch {
        #[command(flatten)]
        archive: ArchiveArgs,
        #[command(flatten)]
        tools: ToolArgs,
        /// Patch tree root
        patch: PathBuf,
        /// Output directory (optional, defaults to rewriting the input pair)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Seconds the first rebuilt entry may take before the run is abandoned
        #[arg(long, default_value_t = hed_patch::patch::DEFAULT_HANG_THRESHOLD.as_secs())]
        hang_threshold: u64,
        /// Loop untagged WAVs over their whole length
        #[arg(long)]
        full_loop: bool,
    },
    /// Rebuild an SCD container from a template and WAV sources
    Build {
        #[command(flatten)]
        tools: ToolArgs,
        /// Template container
        template: PathBuf,
        /// WAV for entry 0; `<stem>_<n>.wav` siblings feed entry n
        wav: PathBuf,
        /// Output container
        output: PathBuf,
        /// Loop untagged WAVs over their whole length
        #[arg(long)]
        full_loop: bool,
    },
    /// Decode an SCD container to WAV with its loop points
    Extract {
        #[command(flatten)]
        tools: ToolArgs,
        /// Input container
        input: PathBuf,
        /// Output WAV (defaults to the input with a .wav extension)
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::List { archive } => {
            let names = archive.names()?;
            let opened = Archive::open(&archive.pair())?;
            for listed in opened.list(&names) {
                let sentinel = listed
                    .header
                    .map(|h| h.compressed_length.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {:>10}  {:>10}  {:>12}  {:>8}  {}{}",
                    listed.entry.hash_hex(),
                    listed.entry.actual_length,
                    listed.entry.stored_length,
                    listed.entry.offset,
                    sentinel,
                    listed.name,
                    if listed.known { "" } else { " (name unknown)" }
                );
            }
        }

        Commands::Unpack {
            archive,
            target,
            output,
        } => {
            let names = archive.names()?;
            let opened = Archive::open(&archive.pair())?;
            let codec = EgsCodec::new(archive.cipher());
            let target = (!target.eq_ignore_ascii_case("all")).then_some(target.as_str());
            let written = opened.unpack(&names, &codec, target, output)?;
            info!("Unpacked {} files into {}", written, output.display());
        }

        Commands::Patch {
            archive,
            tools,
            patch,
            output,
            hang_threshold,
            full_loop,
        } => {
            let names = archive.names()?;
            let tree = PatchTree::scan(patch)?;
            let toolchain = tools.toolchain();
            let options = PatchOptions {
                cipher: archive.cipher(),
                hang_threshold: Duration::from_secs(*hang_threshold),
                build: BuildOptions {
                    full_loop: *full_loop,
                },
            };

            let input = archive.pair();
            let output_pair = match output {
                Some(dir) => {
                    let stem = input
                        .index
                        .file_stem()
                        .context("input has no file name")?
                        .to_string_lossy()
                        .into_owned();
                    ArchivePair::in_dir(dir, &stem)
                }
                None => input.clone(),
            };
            info!(
                "Patching {} with {} into {}",
                input.index.display(),
                patch.display(),
                output_pair.index.display()
            );

            let engine = ArchivePatchEngine::new(&names, &tree, &toolchain, options);
            let report = engine.patch_files(&input, &output_pair, |progress| {
                if progress.outcome != EntryOutcome::Kept {
                    info!(
                        "[{}/{}] {} {:?}",
                        progress.index + 1,
                        progress.total,
                        progress.name,
                        progress.outcome
                    );
                }
            })?;

            for name in &report.failed {
                warn!("Kept original bytes for {}", name);
            }
            println!(
                "{} replaced, {} included, {} failed",
                report.replaced,
                report.included,
                report.failed.len()
            );
        }

        Commands::Build {
            tools,
            template,
            wav,
            output,
            full_loop,
        } => {
            let template_bytes = fs::read(template)
                .with_context(|| format!("reading template {}", template.display()))?;
            let entry_count = ScdFile::parse(&template_bytes)?.entry_count();
            let sources = wav_sources(wav, entry_count)?;

            let toolchain = tools.toolchain();
            let builder = ContainerBuilder::new(
                &toolchain,
                BuildOptions {
                    full_loop: *full_loop,
                },
            );
            let rebuilt = builder.build(&template_bytes, &sources)?;
            fs::write(output, &rebuilt)?;
            info!(
                "Built {} ({} bytes, {} of {} entries rebuilt)",
                output.display(),
                rebuilt.len(),
                sources.len(),
                entry_count
            );
        }

        Commands::Extract {
            tools,
            input,
            output,
        } => {
            let output = output.clone().unwrap_or_else(|| input.with_extension("wav"));
            let toolchain = tools.toolchain();
            let loop_info = ContainerExtractor::new(&toolchain).extract_file(input, &output)?;
            if loop_info.has_loop {
                println!(
                    "{}: loop {}..={}",
                    output.display(),
                    loop_info.start_sample,
                    loop_info.end_sample_inclusive
                );
            } else {
                println!("{}: no loop", output.display());
            }
        }
    }

    Ok(())
}

/// `music.wav` feeds entry 0; existing `music_<n>.wav` siblings feed entry n.
fn wav_sources(first: &Path, entry_count: usize) -> Result<BTreeMap<usize, PathBuf>> {
    if !first.is_file() {
        bail!("WAV source {} not found", first.display());
    }
    let mut sources = BTreeMap::from([(0, first.to_path_buf())]);
    let stem = first
        .file_stem()
        .context("WAV source has no file name")?
        .to_string_lossy()
        .into_owned();
    for index in 1..entry_count {
        let sibling = first.with_file_name(format!("{}_{}.wav", stem, index));
        if sibling.is_file() {
            sources.insert(index, sibling);
        }
    }
    Ok(sources)
}
