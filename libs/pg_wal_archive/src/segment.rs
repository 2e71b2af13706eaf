//! WAL segment name parsing and successor arithmetic (spec §4.5, §8
//! scenario 2). Grounded on `original_source/src/command/archive/find.c`
//! (`walIsSegment`/`walIsPartial`) for the name shape and on the literal
//! `next()` vectors in spec §8 for the version-dependent wraparound.

use pg_util::CoreError;

pub const SEGMENT_NAME_LEN: usize = 24;
pub const WAL_SEGMENT_PARTIAL_EXT: &str = ".partial";

/// PostgreSQL numeric version, `major * 10000 + minor * 100` for
/// pre-10 releases (`90200` = 9.2) or `major * 10000` from 10 onward
/// (`110000` = 11), matching `PG_VERSION_NUM` convention.
pub type PgVersion = u32;

pub const PG_VERSION_92: PgVersion = 90200;
pub const PG_VERSION_93: PgVersion = 90300;

/// Before 9.3 the final segment of every log file was reserved and never
/// assigned, so the last valid segment number is `0xFE` regardless of
/// segment size (the source hard-codes this as `0xFF` segments per log).
const PRE_93_SEGMENT_MAX: u32 = 0xFE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalSegment {
    pub timeline: u32,
    pub log_id: u32,
    pub seg: u32,
}

/// True if `name`'s first 24 characters are hex digits (optionally
/// followed by [`WAL_SEGMENT_PARTIAL_EXT`]).
pub fn is_segment(name: &str) -> bool {
    let core = name.strip_suffix(WAL_SEGMENT_PARTIAL_EXT).unwrap_or(name);
    core.len() == SEGMENT_NAME_LEN && core.bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn is_partial(name: &str) -> bool {
    name.ends_with(WAL_SEGMENT_PARTIAL_EXT)
}

/// First 24 characters of `name`, i.e. the segment id without any
/// `.partial` suffix.
pub fn segment_prefix(name: &str) -> &str {
    &name[..SEGMENT_NAME_LEN.min(name.len())]
}

pub fn parse(name: &str) -> Result<WalSegment, CoreError> {
    if !is_segment(name) {
        return Err(CoreError::Format(format!("'{name}' is not a WAL segment name")));
    }
    let core = segment_prefix(name);
    let timeline = u32::from_str_radix(&core[0..8], 16)
        .map_err(|_| CoreError::Format(format!("'{name}' has an invalid timeline")))?;
    let log_id = u32::from_str_radix(&core[8..16], 16)
        .map_err(|_| CoreError::Format(format!("'{name}' has an invalid log id")))?;
    let seg = u32::from_str_radix(&core[16..24], 16)
        .map_err(|_| CoreError::Format(format!("'{name}' has an invalid segment number")))?;
    Ok(WalSegment { timeline, log_id, seg })
}

impl WalSegment {
    pub fn format(&self) -> String {
        format!("{:08X}{:08X}{:08X}", self.timeline, self.log_id, self.seg)
    }
}

fn segment_max(segment_size: u64, pg_version: PgVersion) -> u32 {
    if pg_version < PG_VERSION_93 {
        PRE_93_SEGMENT_MAX
    } else {
        ((0x1_0000_0000u64 / segment_size) - 1) as u32
    }
}

/// Successor of `segment` under `segment_size`-byte segments on
/// `pg_version`. Wraps into the next log id once `seg` reaches the
/// version/segment-size-dependent maximum.
pub fn next_segment(segment: &str, segment_size: u64, pg_version: PgVersion) -> Result<String, CoreError> {
    let parsed = parse(segment)?;
    let max = segment_max(segment_size, pg_version);

    let next = if parsed.seg >= max {
        WalSegment {
            timeline: parsed.timeline,
            log_id: parsed.log_id + 1,
            seg: 0,
        }
    } else {
        WalSegment {
            seg: parsed.seg + 1,
            ..parsed
        }
    };
    Ok(next.format())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successor_pre_93_wraps_log_at_fe() {
        assert_eq!(
            next_segment("0000000100000001000000FE", 16 * 1024 * 1024, PG_VERSION_92).unwrap(),
            "000000010000000200000000"
        );
    }

    #[test]
    fn successor_93_continues_to_ff_for_16mib_segments() {
        assert_eq!(
            next_segment("0000000100000001000000FE", 16 * 1024 * 1024, PG_VERSION_93).unwrap(),
            "0000000100000001000000FF"
        );
    }

    #[test]
    fn successor_wraps_at_segment_count_for_1mib_segments() {
        assert_eq!(
            next_segment("000000010000006700000FFF", 1024 * 1024, 110_000).unwrap(),
            "000000010000006800000000"
        );
    }

    #[test]
    fn rejects_non_segment_names() {
        assert!(parse("not-a-segment").is_err());
    }

    #[test]
    fn partial_suffix_is_recognized_and_stripped() {
        let name = "000000010000000100000001.partial";
        assert!(is_segment(name));
        assert!(is_partial(name));
        assert_eq!(segment_prefix(name), "000000010000000100000001");
    }
}
