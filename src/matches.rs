//! Match-history table parsing.
//!
//! Turns the rendered `csgo_scoreboard_root` table into [`MatchRecord`]s.
//! Rows are classified by what they contain rather than by position, and a
//! malformed match is reported and skipped without affecting its neighbours.

use crate::error::AcquireError;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

/// Demos for matches younger than this may not be generated yet
pub const RECENT_MATCH_MINUTES: i64 = 30;

const MAP_FIELDS: usize = 5;
const STAT_FIELDS: usize = 7;

fn sel(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

static ROOT_TABLE: Lazy<Selector> = Lazy::new(|| sel("table.csgo_scoreboard_root"));
static MATCH_ROWS: Lazy<Selector> = Lazy::new(|| sel("table.csgo_scoreboard_root > tbody > tr"));
static MAP_INFO_CELL: Lazy<Selector> = Lazy::new(|| sel("td.val_left"));
static MAP_TABLE: Lazy<Selector> = Lazy::new(|| sel("table.csgo_scoreboard_inner_left"));
static PLAYER_TABLE: Lazy<Selector> = Lazy::new(|| sel("table.csgo_scoreboard_inner_right"));
static DOWNLOAD_LINK: Lazy<Selector> = Lazy::new(|| sel("td.csgo_scoreboard_cell_noborder a"));
static TD: Lazy<Selector> = Lazy::new(|| sel("td"));
static TH: Lazy<Selector> = Lazy::new(|| sel("th"));
static TR: Lazy<Selector> = Lazy::new(|| sel("tr"));
static SCORE_CELL: Lazy<Selector> = Lazy::new(|| sel("td.csgo_scoreboard_score"));
static PLAYER_LINK: Lazy<Selector> = Lazy::new(|| sel("a.linkTitle"));

static MVP_CELL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(★)?\s*(\d*)$").expect("static regex"));

// ============================================================================
// Records
// ============================================================================

/// Per-player scoreboard line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayerStats {
    pub ping: u32,
    pub kills: u32,
    pub assists: u32,
    pub deaths: u32,
    pub mvps: u32,
    pub headshot_pct: u8,
    pub score: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub name: String,
    pub stats: PlayerStats,
}

/// One match parsed from the history table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRecord {
    pub tab: String,
    pub map: String,
    pub played_at: DateTime<Utc>,
    pub ranked: bool,
    pub wait_time: String,
    pub duration: String,
    pub score: String,
    pub demo_url: Option<String>,
    /// Players in table order; names are unique within a record
    pub players: Vec<Player>,
}

impl MatchRecord {
    #[cfg(test)]
    pub fn player(&self, name: &str) -> Option<&PlayerStats> {
        self.players.iter().find(|p| p.name == name).map(|p| &p.stats)
    }
}

/// Result of parsing one rendered page
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub records: Vec<MatchRecord>,
    pub skipped_recent: usize,
    pub failures: Vec<AcquireError>,
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse every match row of the page.
///
/// Only a missing root table is an error; per-match problems land in
/// `failures` and parsing moves on.
pub fn parse_match_table(
    html: &str,
    tab: &str,
    now: DateTime<Utc>,
) -> Result<ParseOutcome, AcquireError> {
    let document = Html::parse_document(html);
    if document.select(&ROOT_TABLE).next().is_none() {
        return Err(AcquireError::parse(
            format!("tab '{}'", tab),
            "match table not found",
        ));
    }

    let mut outcome = ParseOutcome::default();
    let rows = document
        .select(&MATCH_ROWS)
        .filter(|row| row.select(&MAP_INFO_CELL).next().is_some());

    for (i, row) in rows.enumerate() {
        let context = format!("tab '{}' match #{}", tab, i + 1);
        match parse_match(row, tab, now, &context) {
            Ok(Some(record)) => outcome.records.push(record),
            Ok(None) => {
                tracing::info!(tab, index = i + 1, "match too recent, skipping");
                outcome.skipped_recent += 1;
            }
            Err(err) => {
                tracing::warn!(tab, index = i + 1, error = %err, "skipping malformed match");
                outcome.failures.push(err);
            }
        }
    }

    tracing::info!(
        tab,
        parsed = outcome.records.len(),
        skipped_recent = outcome.skipped_recent,
        failed = outcome.failures.len(),
        "page scrape complete"
    );
    Ok(outcome)
}

/// Ok(None) means the match is too recent to have a finished demo
fn parse_match(
    row: ElementRef,
    tab: &str,
    now: DateTime<Utc>,
    context: &str,
) -> Result<Option<MatchRecord>, AcquireError> {
    let map_table = row
        .select(&MAP_TABLE)
        .next()
        .ok_or_else(|| AcquireError::parse(context, "map table missing"))?;
    let info = parse_map_table(map_table, context)?;

    if is_too_recent(info.played_at, now) {
        return Ok(None);
    }

    let player_table = row
        .select(&PLAYER_TABLE)
        .next()
        .ok_or_else(|| AcquireError::parse(context, "player table missing"))?;
    let (score, players) = parse_player_table(player_table, context)?;

    Ok(Some(MatchRecord {
        tab: tab.to_string(),
        map: info.map,
        played_at: info.played_at,
        ranked: info.ranked,
        wait_time: info.wait_time,
        duration: info.duration,
        score,
        demo_url: info.demo_url,
        players,
    }))
}

/// A match within the demo-generation lag, or dated in the future
pub fn is_too_recent(played_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - played_at <= Duration::minutes(RECENT_MATCH_MINUTES)
}

struct MapInfo {
    map: String,
    played_at: DateTime<Utc>,
    ranked: bool,
    wait_time: String,
    duration: String,
    demo_url: Option<String>,
}

fn parse_map_table(table: ElementRef, context: &str) -> Result<MapInfo, AcquireError> {
    let demo_url = table
        .select(&DOWNLOAD_LINK)
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(|href| href.trim().to_string())
        .filter(|href| !href.is_empty());

    // The download button cell is not a data field
    let cells: Vec<String> = table
        .select(&TD)
        .filter(|td| !td.value().classes().any(|c| c == "csgo_scoreboard_cell_noborder"))
        .map(cell_text)
        .collect();

    if cells.len() < MAP_FIELDS {
        return Err(AcquireError::parse(
            context,
            format!("map table has {} cells, expected {}", cells.len(), MAP_FIELDS),
        ));
    }

    let played_at =
        parse_match_date(&cells[1]).map_err(|reason| AcquireError::parse(context, reason))?;

    Ok(MapInfo {
        map: cells[0].clone(),
        played_at,
        ranked: labelled_value(&cells[2]).eq_ignore_ascii_case("yes"),
        wait_time: labelled_value(&cells[3]).to_string(),
        duration: labelled_value(&cells[4]).to_string(),
        demo_url,
    })
}

/// Parse `YYYY-MM-DD HH:MM:SS GMT` (GMT or UTC) as a UTC timestamp
pub fn parse_match_date(text: &str) -> Result<DateTime<Utc>, String> {
    let (stamp, zone) = text
        .trim()
        .rsplit_once(' ')
        .ok_or_else(|| format!("date '{}' has no time zone", text))?;
    if !zone.eq_ignore_ascii_case("GMT") && !zone.eq_ignore_ascii_case("UTC") {
        return Err(format!("unsupported time zone '{}' in date '{}'", zone, text));
    }
    NaiveDateTime::parse_from_str(stamp.trim(), "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("bad date '{}': {}", text, e))
}

/// "Wait Time: 00:45" -> "00:45"; unlabelled text is returned unchanged
fn labelled_value(text: &str) -> &str {
    match text.split_once(':') {
        Some((label, value)) if label.chars().any(char::is_alphabetic) => value.trim(),
        _ => text.trim(),
    }
}

fn parse_player_table(
    table: ElementRef,
    context: &str,
) -> Result<(String, Vec<Player>), AcquireError> {
    let mut score: Option<String> = None;
    let mut before_score = 0usize;
    let mut after_score = 0usize;
    let mut players: Vec<Player> = Vec::new();

    for row in table.select(&TR) {
        if row.select(&TH).next().is_some() {
            continue;
        }
        if let Some(cell) = row.select(&SCORE_CELL).next() {
            score = Some(cell_text(cell));
            continue;
        }
        let Some(link) = row.select(&PLAYER_LINK).next() else {
            continue;
        };

        let name = cell_text(link);
        let stats = parse_stats(row, &name, context)?;
        let name = unique_name(&players, name);
        players.push(Player { name, stats });
        if score.is_some() {
            after_score += 1;
        } else {
            before_score += 1;
        }
    }

    let score = score.ok_or_else(|| AcquireError::parse(context, "score row missing"))?;
    if before_score == 0 || after_score == 0 || before_score != after_score {
        return Err(AcquireError::parse(
            context,
            format!(
                "incomplete scoreboard: {} players before score row, {} after",
                before_score, after_score
            ),
        ));
    }

    Ok((score, players))
}

fn parse_stats(row: ElementRef, name: &str, context: &str) -> Result<PlayerStats, AcquireError> {
    // First cell holds the avatar and name
    let texts: Vec<String> = row.select(&TD).skip(1).map(cell_text).collect();
    let cells: Vec<&str> = texts.iter().map(String::as_str).collect();
    if cells.len() < STAT_FIELDS {
        return Err(AcquireError::parse(
            context,
            format!(
                "player '{}' has {} stat cells, expected {}",
                name,
                cells.len(),
                STAT_FIELDS
            ),
        ));
    }

    let bad = |field: &str, text: &str| {
        AcquireError::parse(
            context,
            format!("player '{}' has bad {} value '{}'", name, field, text),
        )
    };
    let count = |field: &str, text: &str| text.parse::<u32>().map_err(|_| bad(field, text));

    Ok(PlayerStats {
        ping: count("ping", cells[0])?,
        kills: count("kills", cells[1])?,
        assists: count("assists", cells[2])?,
        deaths: count("deaths", cells[3])?,
        mvps: parse_mvps(cells[4]).ok_or_else(|| bad("mvp", cells[4]))?,
        headshot_pct: parse_headshot_pct(cells[5]).ok_or_else(|| bad("headshot", cells[5]))?,
        score: cells[6].parse::<i32>().map_err(|_| bad("score", cells[6]))?,
    })
}

/// "" -> 0, "★" -> 1, "★3" -> 3
fn parse_mvps(text: &str) -> Option<u32> {
    let caps = MVP_CELL.captures(text.trim())?;
    let star = caps.get(1).is_some();
    let digits = caps.get(2).map_or("", |m| m.as_str());
    match (star, digits.is_empty()) {
        (_, false) => digits.parse().ok(),
        (true, true) => Some(1),
        (false, true) => Some(0),
    }
}

/// "45%" -> 45, "" -> 0
fn parse_headshot_pct(text: &str) -> Option<u8> {
    let digits = text.trim().trim_end_matches('%').trim();
    if digits.is_empty() {
        return Some(0);
    }
    digits.parse::<u8>().ok().filter(|v| *v <= 100)
}

/// Display names are not unique on Steam; suffix repeats as "name (2)"
fn unique_name(players: &[Player], name: String) -> String {
    if !players.iter().any(|p| p.name == name) {
        return name;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{} ({})", name, n);
        if !players.iter().any(|p| p.name == candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Whitespace-normalized text content of an element
fn cell_text(el: ElementRef) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
