use conductor_protocol::error::{ConductorError, ConductorResult};
use conductor_protocol::session::{SessionCommand, SessionDate, SessionState};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub(crate) fn command_to_json(command: &SessionCommand) -> ConductorResult<String> {
    serde_json::to_string(command).map_err(|err| ConductorError::PersistenceWrite(err.to_string()))
}

pub(crate) fn str_to_command(value: &str) -> Result<SessionCommand, rusqlite::Error> {
    serde_json::from_str(value).map_err(to_from_sql_error)
}

pub(crate) fn str_to_state(value: &str) -> Result<SessionState, rusqlite::Error> {
    value.parse().map_err(to_from_sql_error)
}

pub(crate) fn str_to_date(value: &str) -> Result<SessionDate, rusqlite::Error> {
    value.parse().map_err(to_from_sql_error)
}

pub(crate) fn timestamp_to_str(timestamp: OffsetDateTime) -> ConductorResult<String> {
    timestamp
        .format(&Rfc3339)
        .map_err(|err| ConductorError::PersistenceWrite(err.to_string()))
}

pub(crate) fn str_to_timestamp(value: &str) -> Result<OffsetDateTime, rusqlite::Error> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(to_from_sql_error)
}

/// Sort key preserving creation order within a date partition.
pub(crate) fn timestamp_sort_key(timestamp: OffsetDateTime) -> i64 {
    i64::try_from(timestamp.unix_timestamp_nanos()).unwrap_or(i64::MAX)
}

/// Keeps the newest `max_bytes` of a scrollback.
pub(crate) fn truncate_scrollback(scrollback: &[u8], max_bytes: usize) -> &[u8] {
    if scrollback.len() <= max_bytes {
        return scrollback;
    }
    &scrollback[scrollback.len() - max_bytes..]
}

pub(crate) fn to_from_sql_error<E>(err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}
