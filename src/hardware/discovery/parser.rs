//! Tool Output Parsers
//!
//! Turns the text printed by lsblk, parted, df and udevadm into typed
//! records. The parsers are lenient: unknown keys are skipped, malformed
//! numbers become zero and empty input yields empty output, so a single odd
//! line never aborts a device scan.

use crate::crd::{parse_byte_count, Partition, RawDevice};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// A disk as listed by lsblk
pub type LocalDisk = RawDevice;

// =============================================================================
// Disk Listing
// =============================================================================

/// Parse `lsblk --pairs` output, one disk per non-empty line, in input order
pub fn parse_disk_string(output: &str) -> Vec<LocalDisk> {
    let unquoted = output.replace('"', "");
    let mut disks = Vec::new();

    for line in unquoted.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let mut disk = LocalDisk::default();
        for token in line.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                warn!("Skipping malformed lsblk token {:?}", token);
                continue;
            };
            match key {
                "NAME" => disk.name = value.to_string(),
                "FSTYPE" => disk.filesystem = value.to_string(),
                "MOUNTPOINT" => disk.mount_point = value.to_string(),
                "SIZE" => disk.size = value.parse().unwrap_or(0),
                "STATE" => disk.state = value.to_string(),
                "TYPE" => disk.device_type = value.to_string(),
                "ROTA" => disk.rotational = value.to_string(),
                "RO" => disk.read_only = value == "1",
                "PKNAME" => disk.parent_name = value.to_string(),
                _ => warn!("Unknown lsblk key {}", key),
            }
        }
        disks.push(disk);
    }

    disks
}

// =============================================================================
// Partition Listing
// =============================================================================

/// Column start offsets taken from the `Number ... Flags` header line
#[derive(Debug, Clone, Copy)]
struct ColumnLayout {
    offsets: [usize; 7],
}

impl ColumnLayout {
    const HEADINGS: [&'static str; 7] =
        ["Number", "Start", "End", "Size", "File system", "Name", "Flags"];

    fn from_header(header: &str) -> Option<Self> {
        if !header.is_ascii() {
            return None;
        }
        let mut offsets = [0usize; 7];
        let mut from = 0;
        for (i, heading) in Self::HEADINGS.iter().enumerate() {
            let at = from + header[from..].find(heading)?;
            offsets[i] = at;
            from = at + heading.len();
        }
        Some(Self { offsets })
    }

    fn split(&self, line: &str) -> [String; 7] {
        let chars: Vec<char> = line.chars().collect();
        let column = |i: usize| -> String {
            let start = self.offsets[i].min(chars.len());
            let end = self
                .offsets
                .get(i + 1)
                .copied()
                .unwrap_or(chars.len())
                .min(chars.len());
            chars[start..end.max(start)]
                .iter()
                .collect::<String>()
                .trim()
                .to_string()
        };
        std::array::from_fn(column)
    }

    /// Values wider than their column shift everything right; in that case
    /// the fixed offsets are useless and whitespace splitting is better
    fn fits(&self, line: &str) -> bool {
        let chars: Vec<char> = line.chars().collect();
        self.offsets[1..]
            .iter()
            .all(|&off| off >= chars.len() || off == 0 || chars[off - 1].is_whitespace())
    }
}

fn partition_from_fields(fields: [String; 7]) -> Partition {
    let [number, start, end, size, filesystem, name, flags] = fields;
    Partition {
        number,
        start,
        end,
        size,
        filesystem,
        name,
        flags,
    }
}

fn split_tokens(line: &str) -> [String; 7] {
    let mut tokens = line.split_whitespace();
    std::array::from_fn(|_| tokens.next().unwrap_or_default().to_string())
}

/// Parse `parted print` output; lines after the `Number` header are partitions
pub fn parse_partition_string(output: &str) -> Vec<Partition> {
    let unquoted = output.replace('"', "");
    let mut partitions = Vec::new();
    let mut layout: Option<Option<ColumnLayout>> = None;

    for line in unquoted.lines() {
        match layout {
            None => {
                if line.contains("Number") {
                    layout = Some(ColumnLayout::from_header(line));
                }
            }
            Some(columns) => {
                if line.trim().is_empty() {
                    continue;
                }
                let fields = match columns {
                    Some(c) if c.fits(line) => c.split(line),
                    _ => split_tokens(line),
                };
                debug!("Parsed partition line {:?}", line);
                partitions.push(partition_from_fields(fields));
            }
        }
    }

    partitions
}

/// Parse `parted print free` output into free-space gaps and their byte total
pub fn parse_free_space_string(output: &str) -> (Vec<Partition>, u64) {
    let unquoted = output.replace('"', "");
    let mut gaps = Vec::new();
    let mut unused = 0u64;
    let mut layout: Option<ColumnLayout> = None;

    for line in unquoted.lines() {
        if line.contains("Number") {
            layout = ColumnLayout::from_header(line);
            continue;
        }
        if !line.contains("Free Space") {
            continue;
        }

        let gap = match layout {
            Some(c) if c.fits(line) => partition_from_fields(c.split(line)),
            _ => free_space_from_tokens(line),
        };
        unused += gap.size_bytes();
        gaps.push(gap);
    }

    (gaps, unused)
}

fn free_space_from_tokens(line: &str) -> Partition {
    let head = line.split("Free Space").next().unwrap_or_default();
    let tokens: Vec<&str> = head.split_whitespace().collect();
    // Gaps have no number; a leading token means the line has one anyway
    let (number, rest) = match tokens.len() {
        n if n >= 4 => (tokens[0], &tokens[1..]),
        _ => ("", &tokens[..]),
    };
    Partition {
        number: number.to_string(),
        start: rest.first().copied().unwrap_or_default().to_string(),
        end: rest.get(1).copied().unwrap_or_default().to_string(),
        size: rest.get(2).copied().unwrap_or_default().to_string(),
        filesystem: "Free Space".to_string(),
        ..Default::default()
    }
}

/// Read the `Partition Table:` line of `parted print`
pub fn parse_partition_table_type(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.split_once("Partition Table:"))
        .map(|(_, kind)| kind.trim().to_string())
}

// =============================================================================
// Usage and udev
// =============================================================================

/// Parse `df --output=size,avail` into `Size` and `Avail` byte strings
pub fn parse_usage_output(output: &str) -> BTreeMap<String, String> {
    let mut lines = output.lines().filter(|l| !l.trim().is_empty());
    let mut usage = BTreeMap::new();

    let (Some(header), Some(values)) = (lines.next(), lines.next()) else {
        return usage;
    };

    for (key, value) in header.split_whitespace().zip(values.split_whitespace()) {
        let key = match key {
            "1B-blocks" | "Size" => "Size",
            "Avail" | "Available" => "Avail",
            other => other,
        };
        usage.insert(key.to_string(), parse_byte_count(value).to_string());
    }

    usage
}

/// Parse `udevadm info --query=property` output
pub fn parse_udev_info(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARTED_PRINT: &str = "\
Model: ATA VBOX HARDDISK (scsi)
Disk /dev/sdb: 10737418240B
Sector size (logical/physical): 512B/512B
Partition Table: gpt
Disk Flags:

Number  Start        End          Size         File system  Name      Flags
 1      1048576B     1074790399B  1073741824B  ext4         lsd-a     msftdata
 2      1074790400B  2148532223B  1073741824B               lsd-b
";

    const PARTED_FREE: &str = "\
Partition Table: gpt

Number  Start        End          Size         File system  Name      Flags
        17408B       1048575B     1031168B     Free Space
 1      1048576B     1074790399B  1073741824B  ext4         lsd-a     msftdata
        1074790400B  1095761919B  20971520B    Free Space
";

    #[test]
    fn test_parse_disk_sample_line() {
        let out = r#"NAME="/dev/sda" FSTYPE="" MOUNTPOINT="" SIZE="100" STATE="running" TYPE="disk" ROTA="1" RO="0""#;
        let disks = parse_disk_string(out);
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].name, "/dev/sda");
        assert_eq!(disks[0].size, 100);
        assert_eq!(disks[0].rotational, "1");
        assert!(!disks[0].read_only);
        assert_eq!(disks[0].device_type, "disk");
        assert_eq!(disks[0].state, "running");
    }

    #[test]
    fn test_parse_disks_preserves_order_and_skips_blank_lines() {
        let out = "NAME=\"/dev/sdb\" TYPE=\"disk\" RO=\"1\"\n\n\
                   NAME=\"/dev/sdb1\" TYPE=\"part\" PKNAME=\"/dev/sdb\" WWN=\"x\"\n";
        let disks = parse_disk_string(out);
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].name, "/dev/sdb");
        assert!(disks[0].read_only);
        assert_eq!(disks[1].name, "/dev/sdb1");
        assert_eq!(disks[1].parent_name, "/dev/sdb");
    }

    #[test]
    fn test_parse_disks_empty_input() {
        assert!(parse_disk_string("").is_empty());
        assert!(parse_disk_string("\n  \n").is_empty());
    }

    #[test]
    fn test_parse_disks_bad_size_is_zero() {
        let disks = parse_disk_string("NAME=\"/dev/sdc\" SIZE=\"lots\"");
        assert_eq!(disks[0].size, 0);
    }

    #[test]
    fn test_parse_partitions_after_header() {
        let parts = parse_partition_string(PARTED_PRINT);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].number, "1");
        assert_eq!(parts[0].start, "1048576B");
        assert_eq!(parts[0].end, "1074790399B");
        assert_eq!(parts[0].size, "1073741824B");
        assert_eq!(parts[0].filesystem, "ext4");
        assert_eq!(parts[0].name, "lsd-a");
        assert_eq!(parts[0].flags, "msftdata");

        // blank filesystem column keeps the name in place
        assert_eq!(parts[1].filesystem, "");
        assert_eq!(parts[1].name, "lsd-b");
        assert_eq!(parts[1].flags, "");
    }

    #[test]
    fn test_parse_partitions_whitespace_tokens() {
        let out = "Number Start End Size File system Name Flags\n1 1B 2B 2B xfs data boot\n";
        let parts = parse_partition_string(out);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].number, "1");
        assert_eq!(parts[0].start, "1B");
        assert_eq!(parts[0].end, "2B");
        assert_eq!(parts[0].size, "2B");
        assert_eq!(parts[0].filesystem, "xfs");
        assert_eq!(parts[0].name, "data");
        assert_eq!(parts[0].flags, "boot");
    }

    #[test]
    fn test_parse_partitions_without_header() {
        assert!(parse_partition_string("Partition Table: gpt\n").is_empty());
        assert!(parse_partition_string("").is_empty());
    }

    #[test]
    fn test_parse_free_space() {
        let (gaps, unused) = parse_free_space_string(PARTED_FREE);
        assert_eq!(gaps.len(), 2);
        assert_eq!(gaps[0].number, "");
        assert_eq!(gaps[0].size, "1031168B");
        assert_eq!(gaps[1].start, "1074790400B");
        assert_eq!(unused, 1_031_168 + 20_971_520);
    }

    #[test]
    fn test_parse_free_space_bad_size_counts_zero() {
        let out = "        1B  2B  junk  Free Space\n        3B  4B  10B  Free Space\n";
        let (gaps, unused) = parse_free_space_string(out);
        assert_eq!(gaps.len(), 2);
        assert_eq!(unused, 10);
    }

    #[test]
    fn test_parse_partition_table_type() {
        assert_eq!(parse_partition_table_type(PARTED_PRINT).as_deref(), Some("gpt"));
        assert_eq!(
            parse_partition_table_type("Partition Table: unknown\n").as_deref(),
            Some("unknown")
        );
        assert_eq!(parse_partition_table_type("Error: no label"), None);
    }

    #[test]
    fn test_parse_usage_output() {
        let usage = parse_usage_output(" 1B-blocks        Avail\n10737418240  5368709120\n");
        assert_eq!(usage.get("Size").map(String::as_str), Some("10737418240"));
        assert_eq!(usage.get("Avail").map(String::as_str), Some("5368709120"));
        assert!(parse_usage_output("").is_empty());
    }

    #[test]
    fn test_parse_udev_info() {
        let info = parse_udev_info("DEVNAME=/dev/sdb\nID_BUS=ata\nnoise\nID_SERIAL=VB=1\n");
        assert_eq!(info.get("DEVNAME").map(String::as_str), Some("/dev/sdb"));
        assert_eq!(info.get("ID_BUS").map(String::as_str), Some("ata"));
        assert_eq!(info.get("ID_SERIAL").map(String::as_str), Some("VB=1"));
        assert_eq!(info.len(), 3);
    }
}
