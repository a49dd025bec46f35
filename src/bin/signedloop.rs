use std::{
    fs::OpenOptions,
    io::{self, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ed25519_dalek::SigningKey;
use log::{debug, warn};
use tempfile::NamedTempFile;

use signedloop::{
    device::{read_layout, AttachOptions, VerifiedDevice, DEFAULT_CACHE_PAGES},
    digest::{PageDigest, Sha1Digest, Sha256Digest},
    image::build_image,
    layout::BackingKind,
    signature::KeyRing,
    store::{BackingStore, FileStore},
    util::parse_hex32,
};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum HashType {
    #[default]
    Sha1,
    Sha256,
}

/// signedloop
#[derive(Debug, Parser)]
#[clap(name = "signedloop", version)]
pub struct App {
    /// the digest algorithm of the hash tree
    #[clap(long, value_enum, default_value_t, global = true)]
    hash: HashType,

    /// hex Ed25519 public key accepted for minor 0
    #[clap(long, env = "SIGNEDLOOP_ROOT_KEY", global = true, hide_env_values = true)]
    root_key: Option<String>,
    /// hex Ed25519 public key tried first for other minors
    #[clap(long, env = "SIGNEDLOOP_PRODUCTION_KEY", global = true, hide_env_values = true)]
    production_key: Option<String>,
    /// hex Ed25519 public key tried second for other minors
    #[clap(long, env = "SIGNEDLOOP_DEVELOPMENT_KEY", global = true, hide_env_values = true)]
    development_key: Option<String>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, clap::Args)]
struct ImageArgs {
    /// the image file or block device
    image: PathBuf,
    /// the minor number to attach as, which selects the accepted keys
    #[clap(long, default_value_t = 0)]
    minor: u32,
    /// treat a regular file as a block-device image
    #[clap(long)]
    block_device: bool,
    /// number of pages to cache
    #[clap(long, default_value_t = DEFAULT_CACHE_PAGES)]
    cache_pages: usize,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Writes a new random signing seed, in hex, to a file that must not exist yet
    Keygen { seed: PathBuf },
    /// Prints the public key for a signing seed
    Pubkey { seed: PathBuf },
    /// Builds a signed image from a data file
    Mkimage {
        data: PathBuf,
        output: PathBuf,
        /// the signing seed file
        #[clap(long)]
        key: PathBuf,
        /// lay the image out for a block device (separate count page, whole pages)
        #[clap(long)]
        block_device: bool,
    },
    /// Prints the layout of an image
    Info {
        image: PathBuf,
        #[clap(long)]
        block_device: bool,
    },
    /// Attaches an image and verifies every page
    Verify {
        #[clap(flatten)]
        image: ImageArgs,
        /// number of parallel verification jobs
        #[clap(long, default_value_t = 4)]
        jobs: usize,
    },
    /// Attaches an image and writes its verified data region to stdout
    Cat {
        #[clap(flatten)]
        image: ImageArgs,
    },
}

fn read_seed(path: &Path) -> Result<SigningKey> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading seed file {}", path.display()))?;
    let seed = parse_hex32(text).with_context(|| format!("parsing seed file {}", path.display()))?;
    Ok(SigningKey::from_bytes(&seed))
}

fn open_store(path: &Path, block_device: bool) -> Result<FileStore> {
    let store = FileStore::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(match block_device {
        true => store.with_kind(BackingKind::BlockDevice),
        false => store,
    })
}

impl App {
    fn keyring(&self) -> Result<KeyRing> {
        let (Some(root), Some(production), Some(development)) = (
            &self.root_key,
            &self.production_key,
            &self.development_key,
        ) else {
            bail!("all three public keys are needed (--root-key, --production-key, --development-key)");
        };
        KeyRing::from_hex(root, production, development).context("parsing public keys")
    }
}

fn attach<H: PageDigest>(keys: &KeyRing, args: &ImageArgs) -> Result<VerifiedDevice<H>> {
    let store = open_store(&args.image, args.block_device)?;
    let options = AttachOptions {
        minor: args.minor,
        cache_pages: args.cache_pages,
    };
    VerifiedDevice::attach(Arc::new(store), keys, options)
        .with_context(|| format!("attaching {}", args.image.display()))
}

fn keygen(path: &Path) -> Result<()> {
    let seed: [u8; 32] = rand::random();
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writeln!(file, "{}", hex::encode(seed))?;
    println!("{}", hex::encode(SigningKey::from_bytes(&seed).verifying_key().as_bytes()));
    Ok(())
}

fn mkimage<H: PageDigest>(data: &Path, output: &Path, key: &Path, block_device: bool) -> Result<()> {
    let key = read_seed(key)?;
    let data = std::fs::read(data).with_context(|| format!("reading {}", data.display()))?;
    let kind = match block_device {
        true => BackingKind::BlockDevice,
        false => BackingKind::File,
    };
    let image = build_image::<H>(&data, kind, &key)?;

    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&image)?;
    tmp.as_file().sync_all()?;
    tmp.persist(output)
        .with_context(|| format!("writing {}", output.display()))?;
    debug!("wrote {} bytes to {}", image.len(), output.display());
    Ok(())
}

fn info<H: PageDigest>(path: &Path, block_device: bool) -> Result<()> {
    let store = open_store(path, block_device)?;
    let layout = read_layout::<H>(&store)?;
    println!("kind: {:?}", layout.kind);
    println!("digest: {} ({} bytes)", H::ID, layout.digest_size);
    println!("size: {} bytes", store.size()?);
    println!("data pages: {}", layout.data_page_count);
    println!("level-0 pages: {} (from page {})", layout.level0_page_count, layout.level0_start());
    println!("level-1 pages: {} (from page {})", layout.level1_page_count, layout.level1_start());
    println!("count page: {}", layout.count_page());
    println!("signature page: {}", layout.signature_page());
    Ok(())
}

async fn verify<H: PageDigest>(keys: &KeyRing, args: &ImageArgs, jobs: usize) -> Result<()> {
    let device = Arc::new(attach::<H>(keys, args)?);
    let pages = device.layout().data_page_count;
    let jobs = jobs.clamp(1, 64) as u64;

    let mut tasks = vec![];
    for job in 0..jobs {
        let device = Arc::clone(&device);
        tasks.push(tokio::task::spawn_blocking(move || -> Result<Vec<u64>> {
            let mut bad = vec![];
            for index in (job..pages).step_by(jobs as usize) {
                let page = device.page(index)?;
                if let Err(err) = device.verify_page(&page) {
                    warn!("{err}");
                    bad.push(index);
                }
            }
            Ok(bad)
        }));
    }

    let mut bad = vec![];
    for task in tasks {
        bad.extend(task.await??);
    }
    bad.sort_unstable();

    let stats = device.stats();
    println!(
        "{pages} data pages, {} hashed, {} tag hits, signed by {:?}",
        stats.hashed,
        stats.tag_hits,
        device.signer()
    );
    if !bad.is_empty() {
        bail!("{} pages failed verification: {bad:?}", bad.len());
    }
    Ok(())
}

fn cat<H: PageDigest>(keys: &KeyRing, args: &ImageArgs) -> Result<()> {
    let device = attach::<H>(keys, args)?;
    io::copy(&mut device.reader(), &mut io::stdout().lock())?;
    Ok(())
}

async fn run<H: PageDigest>(args: App) -> Result<()> {
    match args.cmd {
        Command::Keygen { ref seed } => keygen(seed)?,
        Command::Pubkey { ref seed } => {
            let key = read_seed(seed)?;
            println!("{}", hex::encode(key.verifying_key().as_bytes()));
        }
        Command::Mkimage {
            ref data,
            ref output,
            ref key,
            block_device,
        } => mkimage::<H>(data, output, key, block_device)?,
        Command::Info {
            ref image,
            block_device,
        } => info::<H>(image, block_device)?,
        Command::Verify { ref image, jobs } => verify::<H>(&args.keyring()?, image, jobs).await?,
        Command::Cat { ref image } => cat::<H>(&args.keyring()?, image)?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    match args.hash {
        HashType::Sha1 => run::<Sha1Digest>(args).await,
        HashType::Sha256 => run::<Sha256Digest>(args).await,
    }
}
