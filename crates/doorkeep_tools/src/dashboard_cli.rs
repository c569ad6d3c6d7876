#![forbid(unsafe_code)]

use chrono::{NaiveDate, NaiveTime};
use clap::{Args, Parser, Subcommand};

use doorkeep_contracts::access::{BuildingId, RoomId};
use doorkeep_contracts::dashboard::{BlockRequest, LogQuery};
use doorkeep_contracts::UnixTimeNs;
use doorkeep_node::cloud::{BlockOutcome, CloudApi, CloudError, CloudErrorClass, CloudLogRow};

#[derive(Debug, Parser)]
#[command(name = "doorkeep", about = "Operator tools for the doorkeep cloud")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Block a card in a room (updates the permission row, or creates it).
    Block(BlockArgs),
    /// Browse the access log, newest first.
    Logs(LogsArgs),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Args)]
pub struct BlockArgs {
    #[arg(long)]
    pub uid: String,
    #[arg(long)]
    pub room: String,
    #[arg(long, default_value = "")]
    pub building: String,
    #[arg(long, default_value = "")]
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Args)]
pub struct LogsArgs {
    /// Substring of the student/card column, case-insensitive.
    #[arg(long)]
    pub student: Option<String>,
    #[arg(long)]
    pub room: Option<String>,
    #[arg(long)]
    pub building: Option<String>,
    /// First day included, `YYYY-MM-DD`.
    #[arg(long)]
    pub start_date: Option<String>,
    /// Last day included, `YYYY-MM-DD`.
    #[arg(long)]
    pub end_date: Option<String>,
    #[arg(long, allow_negative_numbers = true)]
    pub limit: Option<i64>,
}

pub fn execute_block_command(
    cloud: &dyn CloudApi,
    args: &BlockArgs,
    now: UnixTimeNs,
) -> Result<String, String> {
    let request = BlockRequest::from_form(&args.uid, &args.room, &args.building, &args.reason)
        .map_err(|e| e.to_string())?;
    let outcome = cloud
        .block_card(&request, now)
        .map_err(|e| describe_cloud_error(&e, "DOORKEEP_ACCESS_PERMISSIONS_TABLE"))?;
    Ok(match outcome {
        BlockOutcome::Updated { rows } => format!(
            "BLOCKED {} in room {} ({rows} existing row(s) updated)",
            request.card_id, request.room
        ),
        BlockOutcome::Created => format!(
            "BLOCKED {} in room {} (new permission row created)",
            request.card_id, request.room
        ),
    })
}

pub fn execute_logs_command(cloud: &dyn CloudApi, args: &LogsArgs) -> Result<String, String> {
    let query = build_log_query(args)?;
    let rows = cloud
        .query_access_logs(&query)
        .map_err(|e| describe_cloud_error(&e, "DOORKEEP_ACCESS_LOGS_TABLE"))?;
    Ok(render_log_rows(&rows))
}

pub fn build_log_query(args: &LogsArgs) -> Result<LogQuery, String> {
    let room = optional(args.room.as_deref())
        .map(RoomId::new)
        .transpose()
        .map_err(|e| e.to_string())?;
    let building = optional(args.building.as_deref())
        .map(BuildingId::new)
        .transpose()
        .map_err(|e| e.to_string())?;
    let start = parse_date_filter(args.start_date.as_deref(), false)?;
    let end = parse_date_filter(args.end_date.as_deref(), true)?;
    LogQuery::v1(
        args.student.clone(),
        room,
        building,
        start,
        end,
        args.limit,
    )
    .map_err(|e| e.to_string())
}

/// `YYYY-MM-DD` at midnight UTC, or at 23:59:59 when `end_of_day`.
pub fn parse_date_filter(
    value: Option<&str>,
    end_of_day: bool,
) -> Result<Option<UnixTimeNs>, String> {
    let Some(value) = optional(value) else {
        return Ok(None);
    };
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| format!("invalid date '{value}', expected YYYY-MM-DD"))?;
    let time = if end_of_day {
        NaiveTime::from_hms_opt(23, 59, 59)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    }
    .ok_or_else(|| "invalid time of day".to_string())?;
    let nanos = date
        .and_time(time)
        .and_utc()
        .timestamp_nanos_opt()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| format!("date '{value}' is out of range"))?;
    Ok(Some(UnixTimeNs(nanos)))
}

pub fn render_log_rows(rows: &[CloudLogRow]) -> String {
    if rows.is_empty() {
        return "no access log entries".to_string();
    }
    let mut out = String::from("timestamp\tstudent\troom\tbuilding\tdecision\treason");
    for row in rows {
        out.push('\n');
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            row.timestamp,
            row.student,
            row.room,
            row.building,
            row.decision.as_deref().unwrap_or("-"),
            row.reason.as_deref().unwrap_or("-"),
        ));
        if row.blocked {
            out.push_str("\t[blocked]");
        }
    }
    out
}

fn describe_cloud_error(err: &CloudError, table_var: &str) -> String {
    match err.class() {
        CloudErrorClass::Schema => {
            format!("{err} (check {table_var}, DOORKEEP_CLOUD_URL and DOORKEEP_CLOUD_KEY)")
        }
        CloudErrorClass::Transient => format!("{err} (cloud unreachable, try again)"),
        CloudErrorClass::Rejected => err.to_string(),
    }
}

fn optional(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
