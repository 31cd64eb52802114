use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "reader", author, version, about)]
pub struct Cli {
    /// RON configuration file. A missing file means defaults.
    #[arg(long, global = true, default_value = "reader.ron")]
    pub config: PathBuf,

    /// JSON source list to use instead of the stored catalog.
    #[arg(long, global = true)]
    pub sources: Option<PathBuf>,

    /// Only use enabled sources of this group.
    #[arg(long, global = true)]
    pub group: Option<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Also write the log to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Search every source for a keyword and stream the results.
    Search(SearchArgs),
    /// Look for other sources carrying one book.
    Refresh(RefreshArgs),
    /// List books from a source's explore page.
    Explore(ExploreArgs),
    /// Show the detail page of a book.
    Info(BookArgs),
    /// List the chapters of a book.
    Toc(BookArgs),
    /// Print the text of one chapter.
    Content(ContentArgs),
    /// Store every chapter of a book.
    Cache(CacheArgs),
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    pub keyword: String,

    #[arg(long, default_value_t = 1)]
    pub page: u32,

    /// Cursor returned by a previous run; `-1` starts from the first source.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub last_index: i64,

    /// Stop once this many books were found.
    #[arg(long)]
    pub size: Option<usize>,

    /// Maximum concurrent source requests.
    #[arg(long)]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Args)]
pub struct RefreshArgs {
    #[arg(long)]
    pub name: String,

    #[arg(long, default_value = "")]
    pub author: String,

    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub last_index: i64,

    /// Rescan from the first source instead of resuming after stored ones.
    #[arg(long)]
    pub refresh: bool,

    #[arg(long)]
    pub size: Option<usize>,

    #[arg(long)]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ExploreArgs {
    /// `bookSourceUrl` of the source.
    #[arg(long)]
    pub source: String,

    /// Explore URL template; defaults to the source's `exploreUrl`.
    #[arg(long)]
    pub url: Option<String>,

    #[arg(long, default_value_t = 1)]
    pub page: u32,
}

#[derive(Debug, Args)]
pub struct BookArgs {
    #[arg(long)]
    pub source: String,

    #[arg(long)]
    pub book_url: String,
}

#[derive(Debug, Args)]
pub struct ContentArgs {
    #[arg(long)]
    pub source: String,

    /// Chapter URL, absolute or relative to the source.
    #[arg(long)]
    pub url: String,

    #[arg(long, default_value = "")]
    pub title: String,
}

#[derive(Debug, Args)]
pub struct CacheArgs {
    #[arg(long)]
    pub source: String,

    #[arg(long)]
    pub book_url: String,

    /// Refetch the chapter list and every chapter.
    #[arg(long)]
    pub refresh: bool,

    #[arg(long)]
    pub concurrency: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "reader",
            "search",
            "dune",
            "--last-index",
            "-1",
            "--group",
            "fast",
            "--concurrency",
            "4",
        ])
        .expect("valid arguments");
        assert_eq!(cli.group.as_deref(), Some("fast"));
        assert_eq!(cli.config, PathBuf::from("reader.ron"));
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.keyword, "dune");
                assert_eq!(args.last_index, -1);
                assert_eq!(args.concurrency, Some(4));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn cache_requires_book_url() {
        assert!(Cli::try_parse_from(["reader", "cache", "--source", "https://a.test"]).is_err());
    }
}
