use archivist_server::{ArchiveStatus, ArchiveType, PAGE_SIZE_DEFAULT};
use clap::builder::TypedValueParser;
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand, ValueEnum};
use uuid::Uuid;

/// Top-level CLI entry point.
#[derive(Debug, Default, Parser)]
#[command(
    name = "archivist",
    version,
    author,
    about = "Builds downloadable archives of an indexed corpus"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
    /// Only log errors.
    #[arg(global = true, short = 'q', long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP server together with the build coordinators.
    Serve(ServeArgs),
    /// Run one build in the foreground and exit.
    Build(BuildArgs),
    /// Inspect the archive table.
    Archives(ArchivesArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Skip the build normally started on boot.
    #[arg(long)]
    pub no_startup_build: bool,
}

#[derive(Debug, Args)]
pub struct BuildArgs {
    #[command(subcommand)]
    pub command: BuildCommands,
}

#[derive(Debug, Subcommand)]
pub enum BuildCommands {
    /// Snapshot every record updated at or before the cutoff.
    All(BuildAllArgs),
    /// Archive the records of a saved set.
    Set(BuildSetArgs),
}

#[derive(Debug, Args)]
pub struct BuildAllArgs {
    /// RFC 3339 cutoff instant; defaults to now.
    #[arg(long, value_name = "RFC3339")]
    pub cutoff: Option<String>,
}

#[derive(Debug, Args)]
pub struct BuildSetArgs {
    #[arg(value_name = "SET_ID")]
    pub set_id: String,
}

#[derive(Debug, Args)]
pub struct ArchivesArgs {
    #[command(subcommand)]
    pub command: ArchivesCommands,
}

#[derive(Debug, Subcommand)]
pub enum ArchivesCommands {
    /// List archives as JSON.
    List(ArchivesListArgs),
    /// Print one archive as JSON.
    Get(ArchivesGetArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ArchiveKindArg {
    #[default]
    All,
    SetQuery,
}

impl From<ArchiveKindArg> for ArchiveType {
    fn from(kind: ArchiveKindArg) -> Self {
        match kind {
            ArchiveKindArg::All => ArchiveType::All,
            ArchiveKindArg::SetQuery => ArchiveType::SetQuery,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    Building,
    Complete,
    Failed,
    Cancelled,
}

impl From<StatusArg> for ArchiveStatus {
    fn from(status: StatusArg) -> Self {
        match status {
            StatusArg::Building => ArchiveStatus::Building,
            StatusArg::Complete => ArchiveStatus::Complete,
            StatusArg::Failed => ArchiveStatus::Failed,
            StatusArg::Cancelled => ArchiveStatus::Cancelled,
        }
    }
}

#[derive(Debug, Args)]
pub struct ArchivesListArgs {
    #[arg(long = "type", value_enum, default_value_t = ArchiveKindArg::All)]
    pub archive_type: ArchiveKindArg,
    #[arg(long, value_enum)]
    pub status: Option<StatusArg>,
    #[arg(long, default_value_t = 0)]
    pub offset: usize,
    #[arg(long, default_value_t = PAGE_SIZE_DEFAULT, value_parser = clap::value_parser!(u16).range(1..=100).map(usize::from))]
    pub size: usize,
    /// `field[,asc|desc]`, e.g. `numOfDownloads,desc`.
    #[arg(long)]
    pub sort: Option<String>,
}

#[derive(Debug, Args)]
pub struct ArchivesGetArgs {
    pub id: Uuid,
    #[arg(long = "type", value_enum, default_value_t = ArchiveKindArg::All)]
    pub archive_type: ArchiveKindArg,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_build_all_with_cutoff() {
        let cli = Cli::try_parse_from([
            "archivist",
            "-vv",
            "build",
            "all",
            "--cutoff",
            "2024-01-01T00:00:00Z",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Some(Commands::Build(BuildArgs {
            command: BuildCommands::All(args),
        })) = cli.command
        else {
            panic!("expected build all");
        };
        assert_eq!(args.cutoff.as_deref(), Some("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn archives_list_bounds_page_size() {
        let ok = Cli::try_parse_from([
            "archivist", "archives", "list", "--type", "set-query", "--status", "complete",
            "--size", "100",
        ])
        .unwrap();
        let Some(Commands::Archives(ArchivesArgs {
            command: ArchivesCommands::List(args),
        })) = ok.command
        else {
            panic!("expected archives list");
        };
        assert_eq!(args.archive_type, ArchiveKindArg::SetQuery);
        assert_eq!(args.status, Some(StatusArg::Complete));
        assert_eq!(args.size, 100);

        assert!(Cli::try_parse_from(["archivist", "archives", "list", "--size", "0"]).is_err());
        assert!(Cli::try_parse_from(["archivist", "archives", "list", "--size", "101"]).is_err());
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["archivist", "-q", "-v", "serve"]).is_err());
    }
}
