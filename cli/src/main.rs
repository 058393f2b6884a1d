use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use heapdb_core::{DataType, Schema, TransactionId, Tuple, Value};
use heapdb_storage::{BufferPool, DbFile, HeapFile, StorageConfig};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "heapdb")]
#[command(about = "Create and inspect heap files", long_about = None)]
struct Cli {
    /// Storage configuration file; HEAPDB_* environment variables override it
    #[arg(long, global = true, env = "HEAPDB_CONFIG")]
    config: Option<PathBuf>,
    /// Page size in bytes, overriding the configuration
    #[arg(long, global = true)]
    page_size: Option<usize>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append the rows of a delimited text file to a heap file. A heap file
    /// created by a failed run is removed again
    Convert {
        input: PathBuf,
        output: PathBuf,
        /// Column types, e.g. int,int,char(16)
        #[arg(long)]
        types: String,
        #[arg(long, default_value_t = ',')]
        delimiter: char,
    },
    /// Print every record of a heap file, one per line
    Print {
        file: PathBuf,
        #[arg(long)]
        types: String,
    },
    /// Show page and record statistics of a heap file
    Info {
        file: PathBuf,
        #[arg(long)]
        types: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = StorageConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(page_size) = cli.page_size {
        config = config.with_page_size(page_size);
        config.validate()?;
    }

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    match cli.command {
        Command::Convert {
            input,
            output,
            types,
            delimiter,
        } => {
            let schema = parse_types(&types)?;
            let count = convert(&input, &output, schema, delimiter, &config)?;
            writeln!(out, "wrote {} records to {}", count, output.display())?;
        }
        Command::Print { file, types } => {
            print(&file, parse_types(&types)?, &config, &mut out)?;
        }
        Command::Info { file, types } => {
            report(&file, parse_types(&types)?, &config, &mut out)?;
        }
    }
    out.flush()?;
    Ok(())
}

fn parse_types(types: &str) -> Result<Arc<Schema>> {
    let types = types
        .split(',')
        .map(|t| t.parse::<DataType>().map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("invalid type list '{}'", types))?;
    Ok(Arc::new(Schema::from_types(types)))
}

fn parse_row(line: &str, schema: &Arc<Schema>, delimiter: char) -> Result<Tuple> {
    let fields: Vec<&str> = line.split(delimiter).map(str::trim).collect();
    if fields.len() != schema.num_columns() {
        bail!(
            "expected {} fields, found {}",
            schema.num_columns(),
            fields.len()
        );
    }
    let values = fields
        .iter()
        .zip(schema.types())
        .map(|(field, ty)| Value::parse(field, &ty).map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()?;
    Ok(Tuple::new(Arc::clone(schema), values))
}

fn open(path: &Path, schema: Arc<Schema>, config: &StorageConfig) -> Result<(Arc<HeapFile>, BufferPool)> {
    let file = HeapFile::open(path, schema, config)
        .with_context(|| format!("opening heap file {}", path.display()))?;
    let file = Arc::new(file);
    let pool = BufferPool::new(config.clone());
    pool.register(file.clone());
    Ok((file, pool))
}

/// Rows inserted per transaction. Half the pool is left for the clean pages
/// an insert reads while looking for a free slot.
fn batch_rows(file: &HeapFile, config: &StorageConfig) -> usize {
    file.slots_per_page() * (config.pool_pages / 2).max(1)
}

fn convert(
    input: &Path,
    output: &Path,
    schema: Arc<Schema>,
    delimiter: char,
    config: &StorageConfig,
) -> Result<usize> {
    let reader = BufReader::new(
        File::open(input).with_context(|| format!("opening {}", input.display()))?,
    );
    let created = !output.exists();
    let (file, pool) = open(output, Arc::clone(&schema), config)?;
    let count = append_rows(reader, input, &file, &pool, &schema, delimiter, config);
    if created && count.is_err() {
        drop(pool);
        drop(file);
        std::fs::remove_file(output)
            .with_context(|| format!("removing {}", output.display()))?;
    }
    count
}

fn append_rows(
    reader: impl BufRead,
    input: &Path,
    file: &HeapFile,
    pool: &BufferPool,
    schema: &Arc<Schema>,
    delimiter: char,
    config: &StorageConfig,
) -> Result<usize> {
    let batch = batch_rows(file, config);

    let mut tid = TransactionId::new();
    let mut pending = 0;
    let mut count = 0;
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let inserted = parse_row(&line, schema, delimiter)
            .and_then(|tuple| Ok(file.insert_tuple(pool, tid, tuple)?));
        if let Err(err) = inserted {
            pool.transaction_complete(tid, false)?;
            return Err(err.context(format!("{}:{}", input.display(), index + 1)));
        }

        pending += 1;
        count += 1;
        if pending == batch {
            pool.transaction_complete(tid, true)?;
            tid = TransactionId::new();
            pending = 0;
        }
    }
    pool.transaction_complete(tid, true)?;

    info!(
        "converted {} records into {} pages",
        count,
        file.page_count()?
    );
    Ok(count)
}

fn print(path: &Path, schema: Arc<Schema>, config: &StorageConfig, out: &mut impl Write) -> Result<()> {
    let (file, pool) = open(path, schema, config)?;
    let tid = TransactionId::new();
    for tuple in file.cursor(&pool, tid).records() {
        writeln!(out, "{}", tuple?)?;
    }
    pool.transaction_complete(tid, true)?;
    Ok(())
}

fn report(path: &Path, schema: Arc<Schema>, config: &StorageConfig, out: &mut impl Write) -> Result<()> {
    let (file, pool) = open(path, schema, config)?;
    let tid = TransactionId::new();
    let records = file
        .cursor(&pool, tid)
        .records()
        .collect::<heapdb_storage::Result<Vec<_>>>()?
        .len();
    pool.transaction_complete(tid, true)?;

    let pages = file.page_count()?;
    let capacity = pages as usize * file.slots_per_page();
    writeln!(out, "file:           {}", file.path().display())?;
    writeln!(out, "id:             {}", file.id())?;
    writeln!(out, "schema:         {}", file.schema())?;
    writeln!(out, "page size:      {}", file.page_size())?;
    writeln!(out, "pages:          {}", pages)?;
    writeln!(out, "slots per page: {}", file.slots_per_page())?;
    writeln!(out, "records:        {}", records)?;
    writeln!(out, "free slots:     {}", capacity - records)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_parse_types() {
        let schema = parse_types("int, bigint,char(8)").unwrap();
        assert_eq!(
            schema.types().collect::<Vec<_>>(),
            vec![DataType::Integer, DataType::BigInt, DataType::Char(8)]
        );
        assert!(parse_types("int,blob").is_err());
    }

    #[test]
    fn test_parse_row() {
        let schema = parse_types("int,char(5)").unwrap();
        let tuple = parse_row("7 | hello", &schema, '|').unwrap();
        assert_eq!(
            tuple.values(),
            &[Value::Integer(7), Value::Char("hello".into())]
        );

        assert!(parse_row("7", &schema, '|').is_err());
        assert!(parse_row("x|y", &schema, '|').is_err());
    }

    #[test]
    fn test_convert_print_and_report() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("rows.csv");
        let output = dir.path().join("rows.dat");
        let rows: String = (0..300).map(|i| format!("{},{}\n", i, i * 2)).collect();
        std::fs::write(&input, rows).unwrap();

        // small pool: several batches
        let config = StorageConfig::default()
            .with_page_size(512)
            .with_pool_pages(4);
        let schema = parse_types("int,int").unwrap();
        let count = convert(&input, &output, Arc::clone(&schema), ',', &config).unwrap();
        assert_eq!(count, 300);

        let mut printed = Vec::new();
        print(&output, Arc::clone(&schema), &config, &mut printed).unwrap();
        let printed = String::from_utf8(printed).unwrap();
        assert_eq!(printed.lines().count(), 300);
        assert_eq!(printed.lines().next(), Some("0\t0"));

        let mut report_out = Vec::new();
        report(&output, schema, &config, &mut report_out).unwrap();
        let report_out = String::from_utf8(report_out).unwrap();
        assert!(report_out.contains("records:        300"));
    }

    #[test]
    fn test_failed_convert_leaves_no_new_file() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("rows.csv");
        let output = dir.path().join("rows.dat");
        std::fs::write(&input, "one,2\n").unwrap();

        let schema = parse_types("int,int").unwrap();
        let config = StorageConfig::default();
        assert!(convert(&input, &output, Arc::clone(&schema), ',', &config).is_err());
        assert!(!output.exists());

        // an existing file is kept as it was
        std::fs::write(&input, "1,2\n").unwrap();
        convert(&input, &output, Arc::clone(&schema), ',', &config).unwrap();
        std::fs::write(&input, "x,y\n").unwrap();
        assert!(convert(&input, &output, Arc::clone(&schema), ',', &config).is_err());
        let mut printed = Vec::new();
        print(&output, schema, &config, &mut printed).unwrap();
        assert_eq!(String::from_utf8(printed).unwrap(), "1\t2\n");
    }

    #[test]
    fn test_convert_reports_bad_line() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("rows.csv");
        std::fs::write(&input, "1,2\n3,four\n").unwrap();

        let err = convert(
            &input,
            &dir.path().join("rows.dat"),
            parse_types("int,int").unwrap(),
            ',',
            &StorageConfig::default(),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("rows.csv:2"));
    }
}
