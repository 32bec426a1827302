use clap::Parser;
use isoforge::{
  BootCatalog, BootEntry, CompatibilityLevel, ImageBuilder, ImageOptions, PlatformId, Volume,
};

mod cli;

fn main() {
  pretty_env_logger::init();

  let cli = cli::Cli::parse();

  if let Err(err) = run(cli) {
    eprintln!("error: {err}");
    std::process::exit(1);
  }
}

fn run(cli: cli::Cli) -> isoforge::Result<()> {
  match cli.command {
    cli::Command::Create {
      output,
      directory,
      volume_id,
      boot_image,
      level,
    } => {
      let level = match level {
        1 => CompatibilityLevel::Level1,
        2 => CompatibilityLevel::Level2,
        3 => CompatibilityLevel::Level3,
        _ => return Err(isoforge::Error::Unsupported("interchange level out of range")),
      };

      let mut volume = Volume::new(&volume_id);
      volume.tree = isoforge::scan_directory(&directory)?;

      let mut builder = ImageBuilder::new(ImageOptions {
        level,
        ..Default::default()
      })?;
      builder.set_primary(volume);

      if let Some(path) = boot_image {
        let data = std::fs::read(&path)?;
        let entry = BootEntry::no_emulation(data)?;
        builder.set_boot_catalog(BootCatalog::new(PlatformId::X86, "ISOFORGE", entry));
      }

      let file = std::fs::File::create(&output)?;
      builder.build(std::io::BufWriter::new(file))?;
      log::info!("wrote {}", output.display());
      Ok(())
    }
  }
}
