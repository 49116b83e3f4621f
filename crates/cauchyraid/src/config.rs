//! Line-oriented config file: `data`, `parity`, `content`, `mountpoint`,
//! `blocksize`, `placement`, `parity_threads`, `bitmap_interval` directives.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const MAX_DRIVES: usize = 256 - MAX_PARITY_LEVELS;
pub const MAX_PARITY_LEVELS: usize = 6;
pub const MAX_CONTENT_PATHS: usize = 8;
const DEFAULT_BLOCK_SIZE: u32 = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    MostFree,
    RoundRobin,
    Lfs,
    Pfrd,
}

impl Default for Placement {
    fn default() -> Self {
        Placement::MostFree
    }
}

#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub name: String,
    pub dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub drives: Vec<DriveConfig>,
    /// `parity_paths[0]` is level 1, etc. Always `parity_levels` long, no gaps.
    pub parity_paths: Vec<PathBuf>,
    pub content_paths: Vec<PathBuf>,
    pub mountpoint: PathBuf,
    pub block_size: u32,
    pub placement: Placement,
    pub parity_threads: u32,
    pub bitmap_interval_s: u64,
}

impl Config {
    pub fn parity_levels(&self) -> usize {
        self.parity_paths.len()
    }

    /// Parse and validate a config file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::BadConfig(format!("cannot open '{}': {e}", path.as_ref().display())))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config> {
        let mut drives: Vec<DriveConfig> = Vec::new();
        let mut parity_slots: [Option<PathBuf>; MAX_PARITY_LEVELS] = Default::default();
        let mut content_paths: Vec<PathBuf> = Vec::new();
        let mut mountpoint: Option<PathBuf> = None;
        let mut block_size = DEFAULT_BLOCK_SIZE;
        let mut placement = Placement::MostFree;
        let mut parity_threads: u32 = 1;
        let mut bitmap_interval_s: u64 = 300;

        for (lineno, raw) in text.lines().enumerate() {
            let lineno = lineno + 1;
            let line = match raw.split_once('#') {
                Some((before, _)) => before,
                None => raw,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (key, rest) = match line.split_once(char::is_whitespace) {
                Some((k, r)) => (k, r.trim()),
                None => (line, ""),
            };

            match key {
                "data" => {
                    let (name, dir) = rest
                        .split_once(char::is_whitespace)
                        .map(|(n, d)| (n, d.trim()))
                        .ok_or_else(|| Error::BadConfig(format!("config:{lineno}: bad 'data' line")))?;
                    if name.is_empty() || dir.is_empty() {
                        return Err(Error::BadConfig(format!("config:{lineno}: bad 'data' line")));
                    }
                    if drives.len() >= MAX_DRIVES {
                        return Err(Error::BadConfig(format!("config:{lineno}: too many drives")));
                    }
                    drives.push(DriveConfig {
                        name: name.to_string(),
                        dir: PathBuf::from(dir),
                    });
                }
                "parity" => {
                    let (level_str, path) = rest
                        .split_once(char::is_whitespace)
                        .map(|(l, p)| (l, p.trim()))
                        .ok_or_else(|| {
                            Error::BadConfig(format!(
                                "config:{lineno}: bad 'parity' line — expected: parity LEVEL(1-{MAX_PARITY_LEVELS}) PATH"
                            ))
                        })?;
                    let level: i64 = level_str.trim().parse().unwrap_or(0);
                    if !(1..=MAX_PARITY_LEVELS as i64).contains(&level) || path.is_empty() {
                        return Err(Error::BadConfig(format!(
                            "config:{lineno}: bad 'parity' line — expected: parity LEVEL(1-{MAX_PARITY_LEVELS}) PATH"
                        )));
                    }
                    parity_slots[(level - 1) as usize] = Some(PathBuf::from(path));
                }
                "content" => {
                    if content_paths.len() >= MAX_CONTENT_PATHS {
                        return Err(Error::BadConfig(format!("config:{lineno}: too many content paths")));
                    }
                    content_paths.push(PathBuf::from(rest));
                }
                "mountpoint" => {
                    mountpoint = Some(PathBuf::from(rest));
                }
                "blocksize" => {
                    let kib: i64 = rest
                        .parse()
                        .map_err(|_| Error::BadConfig(format!("config:{lineno}: bad blocksize")))?;
                    if kib <= 0 || kib > (u32::MAX as i64 / 1024) || (kib * 1024) % 64 != 0 {
                        return Err(Error::BadConfig(format!(
                            "config:{lineno}: bad blocksize (must be multiple of 64 bytes when in KiB)"
                        )));
                    }
                    block_size = (kib * 1024) as u32;
                }
                "placement" => {
                    placement = match rest {
                        "mostfree" => Placement::MostFree,
                        "roundrobin" => Placement::RoundRobin,
                        "lfs" => Placement::Lfs,
                        "pfrd" => Placement::Pfrd,
                        other => {
                            return Err(Error::BadConfig(format!(
                                "config:{lineno}: unknown placement policy '{other}'"
                            )));
                        }
                    };
                }
                "parity_threads" => {
                    let val: i64 = rest
                        .parse()
                        .map_err(|_| Error::BadConfig(format!("config:{lineno}: parity_threads must be between 1 and 64")))?;
                    if !(1..=64).contains(&val) {
                        return Err(Error::BadConfig(format!(
                            "config:{lineno}: parity_threads must be between 1 and 64"
                        )));
                    }
                    parity_threads = val as u32;
                }
                "bitmap_interval" => {
                    let val: u64 = rest
                        .parse()
                        .map_err(|_| Error::BadConfig(format!("config:{lineno}: bad bitmap_interval")))?;
                    bitmap_interval_s = val;
                }
                other => {
                    return Err(Error::BadConfig(format!("config:{lineno}: unknown directive '{other}'")));
                }
            }
        }

        let highest = parity_slots.iter().rposition(Option::is_some);
        let mut parity_paths = Vec::new();
        if let Some(highest) = highest {
            for (i, slot) in parity_slots.iter().enumerate().take(highest + 1) {
                match slot {
                    Some(p) => parity_paths.push(p.clone()),
                    None => {
                        return Err(Error::BadConfig(format!(
                            "config: parity levels have a gap — parity {} is missing",
                            i + 1
                        )));
                    }
                }
            }
        }

        if drives.is_empty() {
            return Err(Error::BadConfig("no data drives defined".into()));
        }
        if content_paths.is_empty() {
            return Err(Error::BadConfig("no content file defined".into()));
        }
        let mountpoint = mountpoint.ok_or_else(|| Error::BadConfig("no mountpoint defined".into()))?;
        if mountpoint.as_os_str().is_empty() {
            return Err(Error::BadConfig("no mountpoint defined".into()));
        }

        Ok(Config {
            drives,
            parity_paths,
            content_paths,
            mountpoint,
            block_size,
            placement,
            parity_threads,
            bitmap_interval_s,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> String {
        "data a /mnt/a\ndata b /mnt/b\ncontent /mnt/meta/content\nmountpoint /mnt/pool\n".to_string()
    }

    #[test]
    fn parses_minimal_config() {
        let cfg = Config::parse(&minimal()).unwrap();
        assert_eq!(cfg.drives.len(), 2);
        assert_eq!(cfg.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(cfg.placement, Placement::MostFree);
        assert_eq!(cfg.parity_threads, 1);
        assert_eq!(cfg.bitmap_interval_s, 300);
    }

    #[test]
    fn rejects_missing_mountpoint() {
        let text = "data a /mnt/a\ncontent /mnt/meta/content\n";
        assert!(matches!(Config::parse(text), Err(Error::BadConfig(_))));
    }

    #[test]
    fn rejects_missing_data() {
        let text = "content /mnt/meta/content\nmountpoint /mnt/pool\n";
        assert!(matches!(Config::parse(text), Err(Error::BadConfig(_))));
    }

    #[test]
    fn rejects_gapped_parity_levels() {
        let mut text = minimal();
        text.push_str("parity 1 /mnt/p1/parity\n");
        text.push_str("parity 3 /mnt/p3/parity\n");
        assert!(matches!(Config::parse(&text), Err(Error::BadConfig(_))));
    }

    #[test]
    fn accepts_contiguous_parity_levels() {
        let mut text = minimal();
        text.push_str("parity 1 /mnt/p1/parity\n");
        text.push_str("parity 2 /mnt/p2/parity\n");
        let cfg = Config::parse(&text).unwrap();
        assert_eq!(cfg.parity_levels(), 2);
    }

    #[test]
    fn rejects_non_64_byte_multiple_blocksize() {
        let mut text = minimal();
        text.push_str("blocksize 1\n"); // 1024 bytes, not a multiple of 64? 1024%64==0 actually
        // use a value whose *1024 isn't a multiple of 64: impossible since 1024 is itself
        // a multiple of 64. Use zero/negative instead to hit the other branch.
        let cfg = Config::parse(&text).unwrap();
        assert_eq!(cfg.block_size, 1024);

        let mut bad = minimal();
        bad.push_str("blocksize 0\n");
        assert!(matches!(Config::parse(&bad), Err(Error::BadConfig(_))));
    }

    #[test]
    fn rejects_unknown_directive() {
        let mut text = minimal();
        text.push_str("frobnicate yes\n");
        assert!(matches!(Config::parse(&text), Err(Error::BadConfig(_))));
    }

    #[test]
    fn parses_placement_and_threads() {
        let mut text = minimal();
        text.push_str("placement roundrobin\n");
        text.push_str("parity_threads 4\n");
        let cfg = Config::parse(&text).unwrap();
        assert_eq!(cfg.placement, Placement::RoundRobin);
        assert_eq!(cfg.parity_threads, 4);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let text = "# a comment\n\n  \ndata a /mnt/a   # trailing comment\ncontent /mnt/meta/content\nmountpoint /mnt/pool\n";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.drives[0].name, "a");
        assert_eq!(cfg.drives[0].dir, PathBuf::from("/mnt/a"));
    }
}
