// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{anyhow, bail, Context, Result};
use aoc_image::{
    validate, AuthGeneration, ImageBuilder, InterfaceId, KnownInterfaces, ProtectionEntry,
    ValidatedImage,
};
use aoc_runtime::{Attribute, Config};
use clap::Parser;
use colored::Colorize;
use log::{debug as okay, info, warn};
use serde::Serialize;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use strum::IntoEnumIterator;

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum Generation {
    Gen1,
    Gen2,
}

impl From<Generation> for AuthGeneration {
    fn from(g: Generation) -> Self {
        match g {
            Generation::Gen1 => AuthGeneration::Gen1,
            Generation::Gen2 => AuthGeneration::Gen2,
        }
    }
}

#[derive(Debug, Parser)]
enum Command {
    /// Print the header and tables of a firmware image
    Inspect {
        image: PathBuf,

        /// Print JSON instead of text
        #[clap(long)]
        json: bool,
    },
    /// Check an image the way the boot sequencer does before loading it
    Validate {
        #[clap(short, long)]
        verbose: bool,

        /// Interface IDs this host speaks, one per line
        #[clap(long)]
        interfaces: Option<PathBuf>,

        image: PathBuf,
    },
    /// Build an image from a raw firmware body
    Pack {
        /// firmware body (binary)
        #[clap(short = 'i', long = "in")]
        body: PathBuf,

        /// output file (binary)
        #[clap(short = 'o', long = "out")]
        dest: PathBuf,

        /// Trampoline copied to SRAM on non-secure boots
        #[clap(long)]
        bootloader: Option<PathBuf>,

        /// Version string stored in the header (at most 31 bytes)
        #[clap(long, default_value = "")]
        version: String,

        #[clap(long)]
        release: bool,

        /// Interface ID published by the image; repeat for more
        #[clap(long = "interface")]
        interfaces: Vec<InterfaceId>,

        /// Protection entry as VIRT:PHYS:SIZE; repeat for more
        #[clap(long = "region", value_parser = parse_region)]
        regions: Vec<ProtectionEntry>,

        /// Offset of the IPC control block from the start of the payload
        #[arg(long, value_parser = parse_int::parse::<u32>, default_value = "0")]
        ipc_offset: u32,

        /// Prepend an authentication header of this generation
        #[clap(long)]
        sign: Option<Generation>,

        #[arg(long, value_parser = parse_int::parse::<u32>, default_value = "0")]
        rollback: u32,
    },
    /// Check a runtime configuration file and print it with defaults filled in
    ShowConfig {
        config: Option<PathBuf>,
    },
    /// List the operator attributes the runtime exposes
    Attributes,
}

#[derive(Debug, Parser)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

fn parse_region(s: &str) -> Result<ProtectionEntry, String> {
    let fields = s
        .split(':')
        .map(parse_int::parse::<u32>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("{s:?}: {e}"))?;
    match fields[..] {
        [virt_start, phys_start, size] => Ok(ProtectionEntry {
            virt_start,
            phys_start,
            size,
        }),
        _ => Err(format!("expected VIRT:PHYS:SIZE, got {s:?}")),
    }
}

/// Initializes a logger that pretty-prints the validation walk
fn init_verify_logger(verbose: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    builder
        .format(|buf, record| {
            let mut level_style = buf.style();

            level_style.set_color(match record.level() {
                log::Level::Info => env_logger::fmt::Color::Cyan,
                log::Level::Trace => env_logger::fmt::Color::Blue,
                log::Level::Warn => env_logger::fmt::Color::Yellow,
                log::Level::Error => env_logger::fmt::Color::Red,
                log::Level::Debug => env_logger::fmt::Color::Green,
            });

            writeln!(
                buf,
                "{: <5} | {}",
                level_style.value(match record.level() {
                    log::Level::Info | log::Level::Trace => "",
                    log::Level::Warn => "WARN",
                    log::Level::Error => "ERROR",
                    log::Level::Debug => "OKAY",
                }),
                record.args().to_string().replace('\n', "\n      | ")
            )
        })
        .filter(
            None,
            if verbose {
                log::LevelFilter::Trace
            } else {
                log::LevelFilter::Debug
            },
        )
        .init();
}

#[derive(Serialize)]
struct Region {
    offset: u32,
    size: u32,
}

#[derive(Serialize)]
struct Protection {
    virt_start: u32,
    phys_start: u32,
    size: u32,
}

#[derive(Serialize)]
struct Summary {
    file_size: usize,
    authentication: Option<String>,
    digest_matches: Option<bool>,
    release_type: String,
    container_version: u32,
    firmware_version: u32,
    version: String,
    image_size: u32,
    ipc_offset: u32,
    bootloader: Region,
    interfaces: Vec<String>,
    protection: Vec<Protection>,
}

impl Summary {
    fn new(image: &ValidatedImage) -> Result<Summary> {
        let header = image.header();
        Ok(Summary {
            file_size: image.bytes().len(),
            authentication: image.generation().map(|g| g.to_string()),
            digest_matches: image.digest_matches(),
            release_type: header
                .release()
                .map_or(format!("unknown ({})", header.release_type), |r| r.to_string()),
            container_version: header.container_version,
            firmware_version: header.firmware_version,
            version: image.version(),
            image_size: image.image_size(),
            ipc_offset: image.ipc_offset(),
            bootloader: Region {
                offset: header.bootloader_offset,
                size: header.bootloader_size,
            },
            interfaces: image
                .interface_ids()?
                .iter()
                .map(InterfaceId::to_string)
                .collect(),
            protection: image
                .protection_table()?
                .iter()
                .map(|e| Protection {
                    virt_start: e.virt_start,
                    phys_start: e.phys_start,
                    size: e.size,
                })
                .collect(),
        })
    }

    fn print(&self) {
        println!("{:<20}{} bytes", "file size:", self.file_size);
        match &self.authentication {
            Some(generation) => {
                let digest = match self.digest_matches {
                    Some(true) => "digest ok".green(),
                    _ => "digest MISMATCH".red(),
                };
                println!("{:<20}{generation}, {digest}", "authentication:");
            }
            None => println!("{:<20}{}", "authentication:", "unsigned".yellow()),
        }
        println!("{:<20}{}", "release type:", self.release_type);
        println!("{:<20}{:?}", "version:", self.version);
        println!(
            "{:<20}container {:#x}, firmware {:#x}",
            "versions:", self.container_version, self.firmware_version
        );
        println!("{:<20}{:#x}", "image size:", self.image_size);
        println!("{:<20}{:#x}", "ipc offset:", self.ipc_offset);
        println!(
            "{:<20}{:#x} (+{:#x})",
            "bootloader:", self.bootloader.offset, self.bootloader.size
        );
        println!("{:<20}{}", "interfaces:", self.interfaces.len());
        for id in &self.interfaces {
            println!("    {id}");
        }
        println!("{:<20}{}", "protection entries:", self.protection.len());
        for e in &self.protection {
            println!(
                "    {:#010x} -> {:#010x} (+{:#x})",
                e.virt_start, e.phys_start, e.size
            );
        }
    }
}

fn read_interfaces(path: &Path) -> Result<KnownInterfaces> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("could not read {path:?}"))?;
    let ids = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            line.parse::<InterfaceId>()
                .map_err(|e| anyhow!("bad interface ID {line:?}: {e}"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(KnownInterfaces::new(ids))
}

fn verify(image: &[u8], interfaces: &KnownInterfaces) -> Result<()> {
    info!("=== Image ===");
    let validated = validate(image, interfaces)?;
    okay!("magic is {:#010x}", validated.magic());
    okay!("bootloader and interface table lie within the payload");

    match validated.generation() {
        Some(generation) => {
            okay!("authentication header: {generation}");
            match validated.digest_matches() {
                Some(true) => okay!("recorded digest matches the payload"),
                _ => warn!("recorded digest does not match the payload"),
            }
        }
        None => warn!("image is unsigned and will not load on a secure host"),
    }

    info!("=== Tables ===");
    let ids = validated.interface_ids()?;
    if validated.is_release() {
        okay!("{} interfaces match this host", ids.len());
    } else {
        info!("development image; {} interfaces not checked", ids.len());
    }
    let entries = validated.protection_table()?;
    okay!("{} protection entries", entries.len());
    Ok(())
}

fn main() -> Result<()> {
    let cmd = Opts::parse();

    // Validate has a custom logger; everyone else can use the default
    if !matches!(cmd.cmd, Command::Validate { .. }) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    match cmd.cmd {
        Command::Inspect { image, json } => {
            let bytes =
                std::fs::read(&image).with_context(|| format!("could not read {image:?}"))?;
            // Inspection shows release images whatever their interfaces.
            let validated = validate(&bytes, &|_: &[InterfaceId]| true)?;
            let summary = Summary::new(&validated)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                summary.print();
            }
        }
        Command::Validate {
            verbose,
            interfaces,
            image,
        } => {
            let bytes =
                std::fs::read(&image).with_context(|| format!("could not read {image:?}"))?;
            let known = match interfaces {
                Some(path) => read_interfaces(&path)?,
                None => KnownInterfaces::default(),
            };
            init_verify_logger(verbose);
            if let Err(e) = verify(&bytes, &known) {
                log::error!("{e}");
                bail!("{} failed validation", image.display());
            }
            println!("{}", "image is valid".green());
        }
        Command::Pack {
            body,
            dest,
            bootloader,
            version,
            release,
            interfaces,
            regions,
            ipc_offset,
            sign,
            rollback,
        } => {
            if version.len() > 31 {
                bail!("version {version:?} is longer than 31 bytes");
            }
            let mut builder = ImageBuilder::new()
                .body(std::fs::read(&body).with_context(|| format!("could not read {body:?}"))?)
                .version(version)
                .release(release)
                .interfaces(interfaces)
                .protection(regions)
                .ipc_offset(ipc_offset)
                .rollback(rollback);
            if let Some(path) = bootloader {
                builder = builder.bootloader(
                    std::fs::read(&path).with_context(|| format!("could not read {path:?}"))?,
                );
            }
            if let Some(generation) = sign {
                builder = builder.sign(generation.into());
            }
            let image = builder.build()?;
            std::fs::write(&dest, &image)?;
            info!("{} byte image written to {}", image.len(), dest.display());
        }
        Command::ShowConfig { config } => {
            let config = match config {
                Some(path) => Config::load(&path)?,
                None => Config::default(),
            };
            config.check()?;
            print!("{}", toml::to_string(&config)?);
        }
        Command::Attributes => {
            for attribute in Attribute::iter() {
                println!("{attribute}");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions() {
        let e = parse_region("0:0x9000_0000:0x1000").unwrap();
        assert_eq!((e.virt_start, e.phys_start, e.size), (0, 0x9000_0000, 0x1000));
        assert!(parse_region("0:1").is_err());
        assert!(parse_region("0:x:1").is_err());
    }

    #[test]
    fn summary_of_a_packed_image() {
        let image = ImageBuilder::new()
            .version("1.2.3")
            .bootloader(vec![1; 8])
            .body(vec![0; 64])
            .sign(AuthGeneration::Gen2)
            .build()
            .unwrap();
        let validated = validate(&image, &|_: &[InterfaceId]| true).unwrap();
        let summary = Summary::new(&validated).unwrap();
        assert_eq!(summary.version, "1.2.3");
        assert_eq!(summary.authentication.as_deref(), Some("gen2"));
        assert_eq!(summary.digest_matches, Some(true));
        assert_eq!(summary.bootloader.size, 8);

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&summary).unwrap()).unwrap();
        assert_eq!(json["release_type"], "development");
    }

    #[test]
    fn interface_files() {
        let dir = std::env::temp_dir().join(format!("aoc_ctl_ifaces_{}", std::process::id()));
        std::fs::write(
            &dir,
            "# audio\n00112233-4455-6677-8899-aabbccddeeff\n\n0123456789abcdef0123456789abcdef\n",
        )
        .unwrap();
        let known = read_interfaces(&dir).unwrap();
        std::fs::remove_file(&dir).unwrap();
        assert_eq!(known.len(), 2);
    }
}
