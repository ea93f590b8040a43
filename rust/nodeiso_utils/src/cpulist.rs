// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Kernel cpulist strings ("0-3,8,10-11") as found in
//! `Cpus_allowed_list`, `cpuset.cpus` and friends.

use anyhow::bail;
use anyhow::Result;
use sscanf::sscanf;

/// Expand a cpulist string into an ordered list of CPU ids.
///
/// Tolerates surrounding whitespace and trailing NULs (sysfs reads carry
/// them). An empty string is a valid, empty cpulist: the kernel reports an
/// empty cpuset that way.
pub fn parse_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    if cpulist.is_empty() {
        return Ok(vec![]);
    }

    let mut cpu_ids = vec![];
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist group {:?}", group.trim());
                }
            },
        };
        if max < min {
            bail!("Backwards cpulist range {:?}", group.trim());
        }
        for i in min..(max + 1) {
            cpu_ids.push(i);
        }
    }

    Ok(cpu_ids)
}

/// Collapse a list of CPU ids back into cpulist form. The inverse of
/// [`parse_cpulist`] for sorted, deduplicated input.
pub fn format_cpulist(cpus: &[usize]) -> String {
    let mut groups: Vec<String> = vec![];
    let mut iter = cpus.iter().copied().peekable();

    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end = iter.next().unwrap();
        }
        if start == end {
            groups.push(start.to_string());
        } else {
            groups.push(format!("{start}-{end}"));
        }
    }

    groups.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_singles_and_ranges() {
        assert_eq!(parse_cpulist("0").unwrap(), vec![0]);
        assert_eq!(parse_cpulist("0-3").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpulist("0-2,8,10-11").unwrap(), vec![0, 1, 2, 8, 10, 11]);
    }

    #[test]
    fn test_parse_sysfs_noise() {
        // sysfs reads come with a trailing newline, sometimes a NUL
        assert_eq!(parse_cpulist("4-7\n").unwrap(), vec![4, 5, 6, 7]);
        assert_eq!(parse_cpulist("1, 3 ,5\0").unwrap(), vec![1, 3, 5]);
        assert_eq!(parse_cpulist("").unwrap(), Vec::<usize>::new());
        assert_eq!(parse_cpulist("\n").unwrap(), Vec::<usize>::new());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_cpulist("0-").is_err());
        assert!(parse_cpulist("a-b").is_err());
        assert!(parse_cpulist("3-1").is_err());
    }

    #[test]
    fn test_format() {
        assert_eq!(format_cpulist(&[]), "");
        assert_eq!(format_cpulist(&[5]), "5");
        assert_eq!(format_cpulist(&[0, 1, 2, 3]), "0-3");
        assert_eq!(format_cpulist(&[0, 1, 2, 8, 10, 11]), "0-2,8,10-11");
    }

    #[test]
    fn test_round_trip() {
        for list in ["0", "0-15", "0-3,8-11,16", "2,4,6"] {
            let cpus = parse_cpulist(list).unwrap();
            assert_eq!(format_cpulist(&cpus), list);
        }
    }
}
