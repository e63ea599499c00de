#[macro_use]
extern crate log;
extern crate simplelog;

use hybrid_ftl::Ftl;
use rand::prelude::*;
use simplelog::*;
use time::macros::format_description;

fn main() {
    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!("[hour]:[minute]:[second].[subsecond]"))
        .build();

    SimpleLogger::init(LevelFilter::Info, log_cfg).unwrap();

    let op = 7.0;
    let mut fw = match Ftl::new_with_op(op) {
        Ok(fw) => fw,
        Err(e) => {
            error!("cannot format zone: {}", e);
            return;
        }
    };
    let max_lba = fw.get_max_lba();
    let page_size = fw.zone().config().page_size;

    for lpn in 0..=max_lba {
        fw.write(lpn, &vec![lpn as u8; page_size]).unwrap();
    }
    info!("Drive preconditioned");

    let mut rng: SmallRng = SmallRng::seed_from_u64(7);

    for c in 0..4 {
        for _ in 0..=max_lba {
            let lpn = rng.gen_range(0..=max_lba);
            fw.write(lpn, &vec![c as u8; page_size]).unwrap();
        }
        fw.background_reserve().unwrap();
        info!("Capacity {} randomly written, WAF {:.3}", c, fw.write_amplification());
    }
    fw.flush().unwrap();

    let stats = fw.zone().stats();
    let (lo, hi) = fw.erase_count_spread();
    info!("host writes: {}, WAF: {:.3}", fw.host_writes(), fw.write_amplification());
    info!("erase counts: min {}, max {}", lo, hi);
    info!(
        "merges: {} switch, {} partial, {} full; compactions: {} inactive, {} active; {} pages copied",
        stats.switch_merges,
        stats.partial_merges,
        stats.full_merges,
        stats.inactive_compactions,
        stats.active_compactions,
        stats.pages_copied
    );
    info!(
        "reservations: {} ({} stalled), wear-level moves: {}",
        stats.reservations, stats.stalled_reservations, stats.wear_level_moves
    );
}
