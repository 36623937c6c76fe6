// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for range partitioning.

mod common;

use chrono::Duration;
use common::jan;
use fleetscan::Error;
use fleetscan::partition::{PartitionId, PartitionStatus, partition_range};

#[test]
fn test_partitions_are_contiguous_and_sum_to_range() {
    let start = jan(1);
    let ends = [
        start + Duration::seconds(7),
        start + Duration::hours(5) + Duration::seconds(13),
        jan(5),
        jan(31) + Duration::minutes(17),
    ];

    for end in ends {
        for count in [1usize, 2, 3, 4, 5, 7] {
            let parts = partition_range(start, end, count).unwrap();

            assert_eq!(parts.len(), count);
            assert_eq!(parts[0].start, start);
            assert_eq!(parts[count - 1].end, end);
            for pair in parts.windows(2) {
                assert_eq!(pair[0].end, pair[1].start, "gap or overlap at {}", pair[1].id);
            }
            let total: i64 = parts.iter().map(|p| p.duration().num_seconds()).sum();
            assert_eq!(total, (end - start).num_seconds());

            let longest = parts.iter().map(|p| p.duration()).max().unwrap();
            let shortest = parts.iter().map(|p| p.duration()).min().unwrap();
            assert!(longest - shortest <= Duration::seconds(1));
        }
    }
}

#[test]
fn test_five_days_into_five_partitions() {
    let parts = partition_range(jan(1), jan(6), 5).unwrap();

    for (i, part) in parts.iter().enumerate() {
        assert_eq!(part.id, PartitionId(i as u32));
        assert_eq!(part.start, jan(1 + i as u32));
        assert_eq!(part.end, jan(2 + i as u32));
        assert_eq!(part.duration(), Duration::days(1));
        assert_eq!(part.status, PartitionStatus::Pending);
    }
}

#[test]
fn test_partitioning_is_deterministic() {
    let a = partition_range(jan(1), jan(9), 3).unwrap();
    let b = partition_range(jan(1), jan(9), 3).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_invalid_ranges() {
    assert!(matches!(
        partition_range(jan(2), jan(1), 1),
        Err(Error::InvalidRange(_))
    ));
    assert!(matches!(
        partition_range(jan(1), jan(2), 0),
        Err(Error::InvalidRange(_))
    ));
}
