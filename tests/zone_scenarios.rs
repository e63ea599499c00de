use std::collections::{HashMap, HashSet};

use hybrid_ftl::config::Lpn;
use hybrid_ftl::error::FlashError;
use hybrid_ftl::{Ftl, FtlError, MemFlash, MemMetaStore, ZoneConfig, ZoneOptions};
use rand::prelude::*;

const PAGE: usize = 32;

fn stress_config(options: ZoneOptions) -> ZoneConfig {
    ZoneConfig {
        pages_per_block: 16,
        num_ways: 4,
        blocks_per_group: 2,
        logs_per_group: 3,
        num_logical_blocks: 32,
        num_physical_blocks: 64,
        blocks_per_local_area: 8,
        page_size: PAGE,
        active_pool_size: 3,
        inactive_pool_size: 4,
        max_free_slots: 64,
        ec_group_size: 2,
        wear_level_threshold: 4,
        free_block_threshold: 4,
        options,
    }
}

fn payload(lpn: Lpn, version: u32) -> Vec<u8> {
    let mut out = vec![0u8; PAGE];
    out[..4].copy_from_slice(&lpn.to_le_bytes());
    out[4..8].copy_from_slice(&version.to_le_bytes());
    out
}

fn check_consistency(fw: &mut Ftl<MemFlash, MemMetaStore>, model: &HashMap<Lpn, Vec<u8>>) {
    let free: Vec<_> = fw.zone().free_list().iter().map(|(vbn, _)| vbn).collect();
    let unique: HashSet<_> = free.iter().copied().collect();
    assert_eq!(free.len(), unique.len(), "free list holds a block twice");

    let ppb = fw.zone().config().pages_per_block;
    let mut buf = vec![0u8; PAGE];
    for lpn in 0..=fw.get_max_lba() {
        let present = fw.read(lpn, &mut buf).unwrap();
        match model.get(&lpn) {
            Some(data) => {
                assert!(present, "lpn {lpn} lost");
                assert_eq!(&buf, data, "lpn {lpn} returned stale data");
                let (vpn, deleted) = fw.zone_mut().resolve_for_read(lpn).unwrap();
                assert!(!deleted);
                assert!(!unique.contains(&(vpn / ppb)), "lpn {lpn} lives in a free block");
            }
            None => assert!(!present, "lpn {lpn} should read as deleted"),
        }
    }
}

fn run_workload(cfg: ZoneConfig, seed: u64, ops: usize) {
    let mut fw = Ftl::with_config(cfg).unwrap();
    let mut model: HashMap<Lpn, Vec<u8>> = HashMap::new();
    let mut rng = SmallRng::seed_from_u64(seed);
    let max_lba = fw.get_max_lba();

    for version in 0..ops as u32 {
        // a hot quarter of the space takes half the traffic
        let lpn = if rng.gen_bool(0.5) {
            rng.gen_range(0..=max_lba / 4)
        } else {
            rng.gen_range(0..=max_lba)
        };
        match rng.gen_range(0..20) {
            0 => {
                fw.delete(lpn).unwrap();
                model.remove(&lpn);
            }
            1 => {
                fw.background_reserve().unwrap();
            }
            _ => {
                let data = payload(lpn, version);
                if let Err(e) = fw.write(lpn, &data) {
                    panic!("op {version}: write of lpn {lpn} failed: {e}");
                }
                model.insert(lpn, data);
            }
        }
        assert!(fw.zone().num_free_blocks() > 0, "op {version}: free list ran dry");
        if version % 1000 == 999 {
            check_consistency(&mut fw, &model);
        }
    }

    check_consistency(&mut fw, &model);
    fw.flush().unwrap();
    check_consistency(&mut fw, &model);

    let stats = fw.zone().stats();
    assert!(stats.reservations > 0);
    assert!(stats.full_merges + stats.switch_merges + stats.partial_merges > 0);
}

#[test]
fn random_workload_matches_model() {
    run_workload(stress_config(ZoneOptions::default()), 1, 6000);
}

#[test]
fn random_workload_sorted_fast_mode() {
    let options = ZoneOptions {
        wear_leveling: true,
        mlc_fast_mode: true,
        sorted_free_list: true,
        gc_deleted_pages: true,
    };
    run_workload(stress_config(options), 2, 6000);
}

#[test]
fn random_workload_without_options() {
    let options = ZoneOptions {
        wear_leveling: false,
        mlc_fast_mode: false,
        sorted_free_list: false,
        gc_deleted_pages: false,
    };
    run_workload(stress_config(options), 3, 6000);
}

#[test]
fn fast_mode_with_little_spare_keeps_writing() {
    // one block per group, four spare blocks; fast-mode logs never switch in,
    // so every merge needs a free block up front
    let cfg = ZoneConfig {
        pages_per_block: 8,
        num_ways: 2,
        blocks_per_group: 1,
        logs_per_group: 2,
        num_logical_blocks: 16,
        num_physical_blocks: 20,
        blocks_per_local_area: 8,
        page_size: PAGE,
        active_pool_size: 2,
        inactive_pool_size: 2,
        max_free_slots: 20,
        ec_group_size: 2,
        wear_level_threshold: 4,
        free_block_threshold: 3,
        options: ZoneOptions {
            wear_leveling: true,
            mlc_fast_mode: true,
            sorted_free_list: true,
            gc_deleted_pages: false,
        },
    };
    for seed in 0..6 {
        run_workload(cfg.clone(), seed, 3000);
    }
}

#[test]
fn sequential_rewrite_uses_switch_merges() {
    // two logs per group: a full group must merge before taking the next block
    let cfg = ZoneConfig {
        logs_per_group: 2,
        ..stress_config(ZoneOptions::default())
    };
    let mut fw = Ftl::with_config(cfg).unwrap();
    for round in 0..4u32 {
        for lpn in 0..=fw.get_max_lba() {
            fw.write(lpn, &payload(lpn, round)).unwrap();
        }
    }
    let stats = fw.zone().stats();
    assert!(stats.switch_merges > 0);

    let mut buf = vec![0u8; PAGE];
    for lpn in 0..=fw.get_max_lba() {
        fw.read(lpn, &mut buf).unwrap();
        assert_eq!(buf, payload(lpn, 3));
    }
}

#[test]
fn program_failure_burns_the_page_only() {
    let mut fw = Ftl::with_config(stress_config(ZoneOptions::default())).unwrap();
    fw.write(0, &payload(0, 0)).unwrap();
    let group = fw.zone().group(0).unwrap();
    let vbn = group.log(group.head().unwrap()).vbn;

    fw.zone_mut().flash_mut().inject_program_failure(vbn);
    assert!(matches!(
        fw.write(1, &payload(1, 0)),
        Err(FtlError::Flash(FlashError::ProgramFailed { .. }))
    ));
    fw.zone_mut().flash_mut().clear_failures();

    fw.write(1, &payload(1, 1)).unwrap();
    let mut buf = vec![0u8; PAGE];
    fw.read(0, &mut buf).unwrap();
    assert_eq!(buf, payload(0, 0));
    fw.read(1, &mut buf).unwrap();
    assert_eq!(buf, payload(1, 1));
}

#[test]
fn erase_failure_drops_block_from_write_path() {
    let mut fw = Ftl::with_config(stress_config(ZoneOptions::default())).unwrap();
    let (bad, _) = fw.zone().free_list().peek().unwrap();
    fw.zone_mut().flash_mut().inject_erase_failure(bad);

    assert!(matches!(
        fw.write(5, &payload(5, 0)),
        Err(FtlError::Flash(FlashError::EraseFailed { .. }))
    ));
    assert!(!fw.zone().free_list().contains(bad));

    fw.write(5, &payload(5, 1)).unwrap();
    assert_eq!(fw.zone().num_free_blocks(), 62);
    let mut buf = vec![0u8; PAGE];
    assert!(fw.read(5, &mut buf).unwrap());
    assert_eq!(buf, payload(5, 1));
}

#[test]
fn free_context_lists_open_logs() {
    let mut fw = Ftl::with_config(stress_config(ZoneOptions::default())).unwrap();
    for lpn in [0, 40, 80] {
        fw.write(lpn, &payload(lpn, 0)).unwrap();
    }
    let ctx = fw.zone().free_context();
    assert_eq!(ctx.num_free_blocks, fw.zone().num_free_blocks());
    assert_eq!(ctx.num_active_log_blocks, 3);
    let dgns: Vec<_> = ctx.active_log_entries.iter().map(|e| e.dgn).collect();
    assert_eq!(dgns, vec![0, 1, 2]);
    assert!(ctx.active_log_entries.iter().all(|e| e.clean_page_offset > 0));
}
