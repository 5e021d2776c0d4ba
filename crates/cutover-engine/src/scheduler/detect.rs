// Batch detection and membership synchronization
//
// Turns a data-source result into dynamic-table rows and batch membership:
// new (runbook, batch-time) groups become batches with their full child
// record set in one transaction; existing live batches get a membership diff
// with member-added / member-removed events stamped only on successful
// publish.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use cutover_contracts::{BatchStatus, EngineEvent};
use cutover_core::{plan_new_batch, BatchTimeMode, RunbookSpec};
use cutover_storage::models::{BatchRow, NewBatch, NewMember, NewPhaseExecution, RunbookRow};
use cutover_storage::DynamicRow;
use tracing::{debug, info, warn};

use super::{quantize_batch_time, Scheduler};
use crate::datasource::TableRow;
use crate::error::Result;
use crate::events::publish_event;
use crate::steps;

impl Scheduler {
    /// Query the data source, maintain the dynamic table, and create or
    /// synchronize one batch per batch-time group.
    pub(crate) async fn detect_and_sync(
        &self,
        runbook: &RunbookRow,
        spec: &RunbookSpec,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let client = self.sources.get(&spec.data_source.connection)?;
        let table = client.query(&spec.data_source).await?;
        let columns = spec.data_source.projection()?;
        let mode = spec.data_source.batch_time_mode()?;
        let primary_key = &spec.data_source.primary_key;

        self.db
            .ensure_dynamic_table(&runbook.data_table, &columns)
            .await?;

        let mut dynamic_rows = Vec::with_capacity(table.rows.len());
        let mut current_keys = Vec::with_capacity(table.rows.len());
        let mut groups: BTreeMap<DateTime<Utc>, Vec<&TableRow>> = BTreeMap::new();

        for row in &table.rows {
            let key = match row.get(primary_key).and_then(|c| c.as_deref()) {
                Some(key) if !key.trim().is_empty() => key.trim().to_string(),
                _ => {
                    warn!(runbook = %runbook.name, "row without primary key skipped");
                    continue;
                }
            };

            let batch_time = match &mode {
                BatchTimeMode::Immediate => Some(quantize_batch_time(now)),
                BatchTimeMode::Column(column) => {
                    let cell = row.get(column).and_then(|c| c.as_deref());
                    match cell.and_then(parse_timestamp) {
                        Some(ts) => Some(ts),
                        None => {
                            warn!(
                                runbook = %runbook.name,
                                member_key = %key,
                                cell = ?cell,
                                "unparseable batch time, row excluded from batching"
                            );
                            None
                        }
                    }
                }
            };

            dynamic_rows.push(DynamicRow {
                member_key: key.clone(),
                batch_time,
                values: columns
                    .iter()
                    .map(|column| dynamic_cell(spec, column, row))
                    .collect(),
            });
            current_keys.push(key);

            if let Some(batch_time) = batch_time {
                groups.entry(batch_time).or_default().push(row);
            }
        }

        self.db
            .upsert_dynamic_rows(&runbook.data_table, &columns, &dynamic_rows)
            .await?;
        self.db
            .mark_dynamic_rows_not_current(&runbook.data_table, &current_keys)
            .await?;

        for (batch_time, rows) in groups {
            match self.db.find_batch(&runbook.name, batch_time).await? {
                None => {
                    self.create_auto_batch(runbook, spec, batch_time, &rows, &mode)
                        .await?;
                }
                Some(batch) if batch_accepts_sync(&batch) => {
                    self.sync_batch_members(runbook, spec, &batch, &rows, &mode)
                        .await?;
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    /// §new-batch: one transaction for the batch, its members, its phase
    /// records, and its init records; then the first lifecycle event.
    async fn create_auto_batch(
        &self,
        runbook: &RunbookRow,
        spec: &RunbookSpec,
        batch_time: DateTime<Utc>,
        rows: &[&TableRow],
        mode: &BatchTimeMode,
    ) -> Result<()> {
        // Immediate mode re-reports entities every tick; keys already
        // enrolled in another live batch of this runbook must not start a
        // second pass.
        let shadowed: HashSet<String> = if *mode == BatchTimeMode::Immediate {
            self.db
                .active_member_keys_elsewhere(&runbook.name, 0)
                .await?
                .into_iter()
                .collect()
        } else {
            HashSet::new()
        };

        let primary_key = &spec.data_source.primary_key;
        let mut members = Vec::new();
        for row in rows {
            let Some(key) = row.get(primary_key).and_then(|c| c.as_deref()) else {
                continue;
            };
            let key = key.trim();
            if shadowed.contains(key) {
                continue;
            }
            members.push(NewMember {
                member_key: key.to_string(),
                data_json: member_snapshot(spec, row)?,
            });
        }
        if members.is_empty() {
            debug!(runbook = %runbook.name, %batch_time, "no unshadowed members, batch not created");
            return Ok(());
        }

        let phases: Vec<NewPhaseExecution> = plan_new_batch(spec, batch_time)?
            .into_iter()
            .map(|p| NewPhaseExecution {
                phase_name: p.name,
                runbook_version: runbook.version,
                offset_minutes: p.offset_minutes,
                due_at: p.due_at,
                status: "pending".to_string(),
            })
            .collect();

        let (batch, created_members) = self
            .db
            .create_batch(NewBatch {
                runbook_name: runbook.name.clone(),
                runbook_version: runbook.version,
                batch_start_time: batch_time,
                is_manual: false,
                members,
                phases,
                inits: steps::init_templates(spec)?,
            })
            .await?;

        info!(
            runbook = %runbook.name,
            batch_id = batch.id,
            %batch_time,
            members = created_members.len(),
            "new batch detected"
        );

        if spec.init.is_empty() {
            self.db
                .set_batch_status(batch.id, &[BatchStatus::Detected], BatchStatus::Active)
                .await?;
        } else {
            publish_event(
                self.bus.as_ref(),
                &EngineEvent::BatchInit {
                    runbook_name: runbook.name.clone(),
                    runbook_version: runbook.version,
                    batch_id: batch.id,
                },
            )
            .await?;
            self.db
                .set_batch_status(
                    batch.id,
                    &[BatchStatus::Detected],
                    BatchStatus::InitDispatched,
                )
                .await?;
        }
        Ok(())
    }

    /// §member synchronization: republish unstamped events, refresh
    /// snapshots, then diff additions and removals against the query result.
    async fn sync_batch_members(
        &self,
        runbook: &RunbookRow,
        spec: &RunbookSpec,
        batch: &BatchRow,
        rows: &[&TableRow],
        mode: &BatchTimeMode,
    ) -> Result<()> {
        let existing = self.db.list_members(batch.id).await?;

        // Unstamped dispatch timestamps mean an earlier publish never made
        // it; retry until stamped.
        for member in &existing {
            if member.status == "active" && member.add_dispatched_at.is_none() {
                self.publish_member_added(&runbook.name, batch.id, member.id)
                    .await;
            }
            if member.status == "removed" && member.remove_dispatched_at.is_none() {
                self.publish_member_removed(&runbook.name, batch.id, member.id)
                    .await;
            }
        }

        let primary_key = &spec.data_source.primary_key;
        let mut current: BTreeMap<String, &TableRow> = rows
            .iter()
            .filter_map(|row| {
                row.get(primary_key)
                    .and_then(|c| c.as_deref())
                    .map(|key| (key.trim().to_string(), *row))
            })
            .filter(|(key, _)| !key.is_empty())
            .collect();

        if *mode == BatchTimeMode::Immediate {
            for key in self
                .db
                .active_member_keys_elsewhere(&runbook.name, batch.id)
                .await?
            {
                current.remove(&key);
            }
        }

        let existing_active: HashMap<&str, i64> = existing
            .iter()
            .filter(|m| m.status == "active")
            .map(|m| (m.member_key.as_str(), m.id))
            .collect();

        // Refresh the snapshot of every still-present active member
        for (key, row) in &current {
            if let Some(member_id) = existing_active.get(key.as_str()) {
                self.db
                    .refresh_member_snapshot(*member_id, &member_snapshot(spec, row)?)
                    .await?;
            }
        }

        // Additions
        for (key, row) in &current {
            if existing_active.contains_key(key.as_str()) {
                continue;
            }
            let member = self
                .db
                .upsert_member(
                    batch.id,
                    &NewMember {
                        member_key: key.clone(),
                        data_json: member_snapshot(spec, row)?,
                    },
                )
                .await?;
            info!(batch_id = batch.id, member_key = %key, "member added");
            self.publish_member_added(&runbook.name, batch.id, member.id)
                .await;
        }

        // Removals
        for member in existing.iter().filter(|m| m.status == "active") {
            if current.contains_key(&member.member_key) {
                continue;
            }
            if self.db.mark_member_removed(member.id).await? {
                info!(batch_id = batch.id, member_key = %member.member_key, "member removed");
                self.publish_member_removed(&runbook.name, batch.id, member.id)
                    .await;
            }
        }

        Ok(())
    }

    /// Publish member-added and stamp on success; a failed publish leaves
    /// the stamp null for the next tick.
    async fn publish_member_added(&self, runbook_name: &str, batch_id: i64, member_id: i64) {
        let event = EngineEvent::MemberAdded {
            runbook_name: runbook_name.to_string(),
            batch_id,
            member_id,
        };
        match publish_event(self.bus.as_ref(), &event).await {
            Ok(()) => {
                if let Err(e) = self.db.stamp_add_dispatched(member_id).await {
                    warn!(member_id, "failed to stamp add dispatch: {e}");
                }
            }
            Err(e) => warn!(member_id, "member-added publish failed, will retry: {e}"),
        }
    }

    async fn publish_member_removed(&self, runbook_name: &str, batch_id: i64, member_id: i64) {
        let event = EngineEvent::MemberRemoved {
            runbook_name: runbook_name.to_string(),
            batch_id,
            member_id,
        };
        match publish_event(self.bus.as_ref(), &event).await {
            Ok(()) => {
                if let Err(e) = self.db.stamp_remove_dispatched(member_id).await {
                    warn!(member_id, "failed to stamp remove dispatch: {e}");
                }
            }
            Err(e) => warn!(member_id, "member-removed publish failed, will retry: {e}"),
        }
    }
}

fn batch_accepts_sync(batch: &BatchRow) -> bool {
    !batch.is_manual
        && batch
            .status
            .parse::<BatchStatus>()
            .map(|s| s.is_live())
            .unwrap_or(false)
}

/// A member's data snapshot: every projected column, multi-valued cells as
/// JSON arrays.
fn member_snapshot(spec: &RunbookSpec, row: &TableRow) -> Result<serde_json::Value> {
    let mut map = serde_json::Map::new();
    for (column, cell) in row {
        let value = match cell {
            None => serde_json::Value::Null,
            Some(raw) => match spec.data_source.multi_valued_format(column) {
                Some(format) => serde_json::Value::Array(
                    format
                        .parse_values(raw)
                        .into_iter()
                        .map(serde_json::Value::String)
                        .collect(),
                ),
                None => serde_json::Value::String(raw.clone()),
            },
        };
        map.insert(column.clone(), value);
    }
    Ok(serde_json::Value::Object(map))
}

/// A dynamic-table cell: multi-valued columns stored as JSON-array text.
fn dynamic_cell(spec: &RunbookSpec, column: &str, row: &TableRow) -> Option<String> {
    let raw = row.get(column).and_then(|c| c.clone())?;
    match spec.data_source.multi_valued_format(column) {
        Some(format) => serde_json::to_string(&format.parse_values(&raw)).ok(),
        None => Some(raw),
    }
}

/// Parse a batch-time cell: RFC 3339 first, then common warehouse formats,
/// then a bare date at midnight. Naive timestamps are taken as UTC.
fn parse_timestamp(cell: &str) -> Option<DateTime<Utc>> {
    let trimmed = cell.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_formats() {
        assert_eq!(
            parse_timestamp("2026-06-01T12:00:00Z").unwrap(),
            "2026-06-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(
            parse_timestamp("2026-06-01 12:00:00").unwrap(),
            "2026-06-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(
            parse_timestamp("2026-06-01").unwrap(),
            "2026-06-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert!(parse_timestamp("soon").is_none());
        assert!(parse_timestamp("").is_none());
    }
}
