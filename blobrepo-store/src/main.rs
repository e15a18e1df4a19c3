use std::path::PathBuf;

use anyhow::{bail, Context};
use tracing::info;
use tracing_subscriber::EnvFilter;

use blobrepo_common::{Namespace, PathType};
use blobrepo_store::config::{self, NAMESPACE};
use blobrepo_store::index_dir::FsIndexDirectory;
use blobrepo_store::BackupRepository;

const USAGE: &str = "usage: blobrepo <config.toml> <command> [args]

commands:
  mkdir <location>
  ls <location>
  stat <location>
  rm <location>
  backup <local-dir> <file> <location>
  restore <location> <file> <local-dir>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, command, rest) = match args.as_slice() {
        [config_path, command, rest @ ..] => (config_path, command.as_str(), rest),
        _ => bail!("{USAGE}"),
    };

    let properties = config::load_properties(&PathBuf::from(config_path))?;
    let namespace: Namespace = properties
        .get(NAMESPACE)
        .map(|s| s.parse::<Namespace>())
        .transpose()?
        .unwrap_or(Namespace::Hierarchical);

    let mut repo = BackupRepository::new(namespace);
    repo.init(properties)
        .with_context(|| format!("Failed to initialize repository from {config_path}"))?;
    info!(namespace = %namespace, command, "blobrepo starting");

    let result = run(&repo, command, rest).await;
    repo.close();
    result
}

async fn run(repo: &BackupRepository, command: &str, args: &[String]) -> anyhow::Result<()> {
    match (command, args) {
        ("mkdir", [location]) => {
            let path = repo.normalize(location)?;
            repo.create_directory(&path).await?;
            println!("{path}");
        }
        ("ls", [location]) => {
            let path = repo.normalize(location)?;
            for entry in repo.list_all(&path).await? {
                println!("{entry}");
            }
        }
        ("stat", [location]) => {
            let path = repo.normalize(location)?;
            let kind = match repo.get_path_type(&path).await? {
                PathType::File => "file",
                PathType::Directory => "directory",
            };
            let exists = repo.exists(&path).await?;
            println!("{path}\t{kind}\texists={exists}");
        }
        ("rm", [location]) => {
            let path = repo.normalize(location)?;
            repo.delete_directory(&path).await?;
        }
        ("backup", [local_dir, file, location]) => {
            let dest = repo.create_uri(location).await?;
            let source = FsIndexDirectory::new(local_dir);
            repo.copy_file_from(&source, file, &dest).await?;
        }
        ("restore", [location, file, local_dir]) => {
            let source = repo.normalize(location)?;
            let dest = FsIndexDirectory::new(local_dir);
            repo.copy_file_to(&source, file, &dest).await?;
        }
        _ => bail!("unknown command or wrong arguments: {command}\n\n{USAGE}"),
    }
    Ok(())
}
