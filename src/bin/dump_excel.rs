//! Print every sheet of a workbook, one tab-separated line per row.

use anyhow::{Context as _, Result};
use clap::Parser;

use handwriting_scanner_lib::excel;

#[derive(Parser)]
#[command(name = "dump_excel", about = "Print the contents of an .xlsx workbook")]
struct Args {
    /// Workbook to read
    file: std::path::PathBuf,

    /// Only print this sheet
    #[arg(long)]
    sheet: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let bytes = std::fs::read(&args.file)
        .with_context(|| format!("Could not read {}", args.file.display()))?;
    let sheets = excel::read_sheets(&bytes)?;

    for (name, rows) in sheets {
        if args.sheet.as_deref().is_some_and(|s| s != name) {
            continue;
        }
        println!("== {} ({} rows)", name, rows.len());
        for row in rows {
            println!("{}", row.join("\t"));
        }
        println!();
    }
    Ok(())
}
