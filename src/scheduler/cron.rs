use chrono::{DateTime, Utc};
use croner::{
    CronIterator, Direction,
    parser::{CronParser, Seconds},
};

/// Compute the milliseconds from `now` until `cron_expr`'s next valid fire
/// time. Cron parsing itself is the excluded collaborator (§1); this is
/// just the one query the scheduler needs out of it.
pub fn ms_until_next_valid(
    cron_expr: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<i64> {
    let schedule = CronParser::builder()
        .seconds(Seconds::Optional)
        .build()
        .parse(cron_expr)
        .map_err(|err| anyhow::anyhow!("{cron_expr:?} is not a valid cron expression: {err:?}"))?;

    let next = CronIterator::new(schedule, now, false, Direction::Forward)
        .next()
        .ok_or_else(|| anyhow::anyhow!("cron expression {cron_expr:?} has no future occurrence"))?;

    Ok((next - now).num_milliseconds().max(0))
}
