use std::collections::{HashMap, HashSet};

use rusqlite::{params_from_iter, Connection};

use meshrank_protocol::PacketUpdate;

use crate::db::DbError;

/// One raw `messages` row, before path resolution/observer merge (C3 takes
/// it from here).
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    pub message_hash: String,
    pub frame_hash: String,
    pub channel_name: String,
    pub sender: Option<String>,
    pub body: String,
    pub ts: String,
    pub path_json: Option<String>,
    pub path_text: Option<String>,
    pub path_length: u32,
    pub repeats: u32,
}

/// Aggregated observer data for a set of message hashes: distinct observer
/// ids and the union of path tokens contributed by each observer.
#[derive(Debug, Clone, Default)]
pub struct ObserverAgg {
    pub observer_ids: Vec<String>,
    pub paths: Vec<Vec<String>>,
}

pub fn read_messages(
    conn: &Connection,
    channel: Option<&str>,
    limit: u32,
    before: Option<&str>,
) -> Result<Vec<MessageRow>, DbError> {
    let mut sql = String::from(
        "SELECT message_hash, frame_hash, channel_name, sender, body, ts, path_json, path_text, \
         path_length, repeats FROM messages WHERE 1=1",
    );
    let mut args: Vec<String> = Vec::new();
    if let Some(channel) = channel {
        sql.push_str(" AND channel_name = ?");
        args.push(channel.to_owned());
    }
    if let Some(before) = before {
        sql.push_str(" AND ts < ?");
        args.push(before.to_owned());
    }
    sql.push_str(" ORDER BY ts DESC LIMIT ?");
    args.push(limit.to_string());

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), map_message_row)?;
    let mut out: Vec<MessageRow> = rows.collect::<Result<_, _>>()?;
    // Ordering: callers always receive ascending ts (§4.4); the DESC/LIMIT
    // query above selects the newest `limit` rows, so flip before returning.
    out.reverse();
    Ok(out)
}

pub fn find_message(conn: &Connection, message_hash: &str) -> Result<Option<MessageRow>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT message_hash, frame_hash, channel_name, sender, body, ts, path_json, path_text, \
         path_length, repeats FROM messages WHERE message_hash = ?1",
    )?;
    let mut rows = stmt.query_map([message_hash], map_message_row)?;
    Ok(rows.next().transpose()?)
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        message_hash: row.get(0)?,
        frame_hash: row.get(1)?,
        channel_name: row.get(2)?,
        sender: row.get(3)?,
        body: row.get(4)?,
        ts: row.get(5)?,
        path_json: row.get(6)?,
        path_text: row.get(7)?,
        path_length: row.get::<_, i64>(8)? as u32,
        repeats: row.get::<_, i64>(9)? as u32,
    })
}

/// Batch lookup of observer aggregates for a set of message hashes, used so
/// C3/C4 never issue one query per message.
pub fn read_message_observer_agg(
    conn: &Connection,
    hashes: &[String],
) -> Result<HashMap<String, ObserverAgg>, DbError> {
    if hashes.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders = hashes.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "SELECT message_hash, observer_id, path_json, path_text FROM message_observers \
         WHERE message_hash IN ({placeholders})"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(hashes.iter()), |row| {
        let hash: String = row.get(0)?;
        let observer_id: String = row.get(1)?;
        let path_json: Option<String> = row.get(2)?;
        let path_text: Option<String> = row.get(3)?;
        Ok((hash, observer_id, path_json, path_text))
    })?;
    let mut agg: HashMap<String, ObserverAgg> = HashMap::new();
    for row in rows {
        let (hash, observer_id, path_json, path_text) = row?;
        let entry = agg.entry(hash).or_default();
        entry.observer_ids.push(observer_id);
        let path = decode_path(path_json.as_deref(), path_text.as_deref());
        if !path.is_empty() {
            entry.paths.push(path);
        }
    }
    Ok(agg)
}

pub fn decode_path(path_json: Option<&str>, path_text: Option<&str>) -> Vec<String> {
    if let Some(json) = path_json {
        if let Ok(tokens) = serde_json::from_str::<Vec<String>>(json) {
            return tokens;
        }
    }
    if let Some(text) = path_text {
        return text
            .split('|')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    Vec::new()
}

pub fn last_message_observer_rowid(conn: &Connection) -> Result<i64, DbError> {
    Ok(conn
        .query_row("SELECT coalesce(max(rowid), 0) FROM message_observers", [], |r| r.get(0))
        .unwrap_or(0))
}

pub fn last_message_rowid(conn: &Connection) -> Result<i64, DbError> {
    Ok(conn
        .query_row("SELECT coalesce(max(rowid), 0) FROM messages", [], |r| r.get(0))
        .unwrap_or(0))
}

/// Rows inserted after `after_rowid`, oldest first, for the live-update
/// poller. `messages` has no autoincrement column of its own (its primary
/// key is the hash), so this rides SQLite's implicit `rowid`.
pub fn read_messages_since(
    conn: &Connection,
    after_rowid: i64,
    limit: u32,
) -> Result<Vec<(i64, MessageRow)>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT rowid, message_hash, frame_hash, channel_name, sender, body, ts, path_json, path_text, \
         path_length, repeats FROM messages WHERE rowid > ?1 ORDER BY rowid ASC LIMIT ?2",
    )?;
    let rows = stmt.query_map(rusqlite::params![after_rowid, limit], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            MessageRow {
                message_hash: row.get(1)?,
                frame_hash: row.get(2)?,
                channel_name: row.get(3)?,
                sender: row.get(4)?,
                body: row.get(5)?,
                ts: row.get(6)?,
                path_json: row.get(7)?,
                path_text: row.get(8)?,
                path_length: row.get::<_, i64>(9)? as u32,
                repeats: row.get::<_, i64>(10)? as u32,
            },
        ))
    })?;
    rows.collect::<Result<_, _>>().map_err(DbError::from)
}

/// `message_observers` rows inserted after `after_rowid`, collapsed into one
/// [`PacketUpdate`] per distinct `message_hash` (§4.9's 1s poll). Returns the
/// highest rowid seen so the caller can advance its cursor even when several
/// rows for the same message land in one tick.
pub fn read_message_observer_updates_since(
    conn: &Connection,
    after_rowid: i64,
    limit: u32,
) -> Result<(i64, Vec<PacketUpdate>), DbError> {
    let mut stmt = conn.prepare(
        "SELECT rowid, message_hash FROM message_observers WHERE rowid > ?1 ORDER BY rowid ASC LIMIT ?2",
    )?;
    let rows: Vec<(i64, String)> = stmt
        .query_map(rusqlite::params![after_rowid, limit], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<_, _>>()?;

    let Some(max_rowid) = rows.iter().map(|(rowid, _)| *rowid).max() else {
        return Ok((after_rowid, Vec::new()));
    };

    let mut seen: HashSet<String> = HashSet::new();
    let mut hashes: Vec<String> = Vec::new();
    for (_, hash) in &rows {
        if seen.insert(hash.clone()) {
            hashes.push(hash.clone());
        }
    }

    let agg = read_message_observer_agg(conn, &hashes)?;
    let placeholders = hashes.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "SELECT message_hash, frame_hash, path_length, repeats FROM messages WHERE message_hash IN ({placeholders})"
    );
    let mut mstmt = conn.prepare(&sql)?;
    let mrows = mstmt.query_map(params_from_iter(hashes.iter()), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;

    let mut updates = Vec::new();
    for row in mrows {
        let (message_hash, frame_hash, path_length, repeats) = row?;
        let observer_hits = agg.get(&message_hash).map(|a| a.observer_ids.clone()).unwrap_or_default();
        updates.push(PacketUpdate {
            message_hash,
            frame_hash,
            observer_hits,
            path_length,
            repeats,
        });
    }
    Ok((max_rowid, updates))
}
