use chrono::{Duration, NaiveDate};
use common::types::Exchange;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run(RunArgs),
    CreateShutdownFile,
    RemoveShutdownFile,
    CheckShutdownFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunArgs {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Empty means all exchanges in the fixed LSE, CME, NYQ order.
    pub exchanges: Vec<Exchange>,
    pub idempotent: bool,
    pub verbose: bool,
    pub database: Option<String>,
    pub config: Option<String>,
}

impl RunArgs {
    pub fn dates(&self) -> Vec<NaiveDate> {
        let (Some(start), Some(end)) = (self.start_date, self.end_date) else {
            return Vec::new();
        };
        let mut dates = Vec::new();
        let mut current = start;
        while current <= end {
            dates.push(current);
            current += Duration::days(1);
        }
        dates
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        if self.exchanges.is_empty() {
            Exchange::ALL.to_vec()
        } else {
            self.exchanges.clone()
        }
    }
}

fn parse_date(flag: &str, value: Option<&String>) -> Result<NaiveDate, String> {
    let value = value.ok_or_else(|| format!("{flag} requires a YYYY-MM-DD value"))?;
    value
        .parse()
        .map_err(|_| format!("{flag}: invalid date {value:?} (expected YYYY-MM-DD)"))
}

fn set_shutdown(slot: &mut Option<Command>, cmd: Command) -> Result<(), String> {
    if slot.is_some() {
        return Err("only one shutdown-file option may be given".to_string());
    }
    *slot = Some(cmd);
    Ok(())
}

pub fn parse_args<I>(args: I) -> Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let argv: Vec<String> = args.skip(1).collect();

    let mut run = RunArgs::default();
    let mut shutdown_command: Option<Command> = None;
    let mut i = 0;

    while i < argv.len() {
        let arg = argv[i].as_str();
        i += 1;
        match arg {
            "--date" => {
                let date = parse_date("--date", argv.get(i))?;
                i += 1;
                run.start_date = Some(date);
                run.end_date = Some(date);
            }
            "--start-date" => {
                run.start_date = Some(parse_date("--start-date", argv.get(i))?);
                i += 1;
            }
            "--end-date" => {
                run.end_date = Some(parse_date("--end-date", argv.get(i))?);
                i += 1;
            }
            "--exchanges" => {
                let mut any = false;
                while i < argv.len() && !argv[i].starts_with('-') {
                    let exchange: Exchange = argv[i].parse()?;
                    if !run.exchanges.contains(&exchange) {
                        run.exchanges.push(exchange);
                    }
                    i += 1;
                    any = true;
                }
                if !any {
                    return Err("--exchanges requires at least one of LSE, CME, NYQ".to_string());
                }
            }
            "--idempotent" | "--resume" => run.idempotent = true,
            "--verbose" | "-v" => run.verbose = true,
            "--database" => {
                run.database = Some(
                    argv.get(i)
                        .cloned()
                        .ok_or("--database requires a file path")?,
                );
                i += 1;
            }
            "--config" => {
                run.config = Some(argv.get(i).cloned().ok_or("--config requires a file path")?);
                i += 1;
            }
            "--create-shutdown-file" => {
                set_shutdown(&mut shutdown_command, Command::CreateShutdownFile)?;
            }
            "--remove-shutdown-file" => {
                set_shutdown(&mut shutdown_command, Command::RemoveShutdownFile)?;
            }
            "--check-shutdown-file" => {
                set_shutdown(&mut shutdown_command, Command::CheckShutdownFile)?;
            }
            other => return Err(format!("unknown option: {other}")),
        }
    }

    if let Some(cmd) = shutdown_command {
        return Ok(cmd);
    }

    let Some(start) = run.start_date else {
        return Err("a run requires --date (or --start-date/--end-date)".to_string());
    };
    let end = run.end_date.unwrap_or(start);
    if end < start {
        return Err("--end-date must not precede --start-date".to_string());
    }
    run.start_date = Some(start);
    run.end_date = Some(end);
    Ok(Command::Run(run))
}
