//! Workload driver for the maps.
//!
//! Fixed-time mode (default) runs `-p` threads over a key space of `2n`
//! keys for `-tt` seconds per trial: `-u` percent of operations are
//! updates (half inserts, half removes), the rest are finds, keys drawn
//! uniformly or Zipfian (`-z`). Fixed-op mode (`-insert_find_delete`)
//! makes each thread insert, find, then delete its share of `n` keys.
//! After every trial the structure is checked against the operation
//! counts unless `-no_check` is given.
//!
//! Exits 0 on success, 1 on a failed check or bad usage.

use std::str::FromStr;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use keel::mem::epoch::with_epoch;
use keel::sync::hash;
use keel::sync::list::ListMap;
use keel::sync::snaplist::SnapList;

struct CommandLine {
    args: Vec<String>,
}

impl CommandLine {
    fn flag(&self, name: &str) -> bool {
        self.args.iter().any(|a| a == name)
    }

    fn value<T: FromStr + Copy>(&self, name: &str, default: T) -> T {
        match self.args.iter().position(|a| a == name) {
            Some(i) => match self.args.get(i + 1).and_then(|v| v.parse().ok()) {
                Some(v) => v,
                None => {
                    eprintln!("bench: {} needs a value", name);
                    std::process::exit(1);
                }
            },
            None => default,
        }
    }

    fn string(&self, name: &str, default: &str) -> String {
        match self.args.iter().position(|a| a == name) {
            Some(i) => match self.args.get(i + 1) {
                Some(v) => v.clone(),
                None => {
                    eprintln!("bench: {} needs a value", name);
                    std::process::exit(1);
                }
            },
            None => default.to_string(),
        }
    }
}

struct Config {
    n: usize,
    procs: usize,
    rounds: usize,
    update_percent: u64,
    zipfian: f64,
    trial_time: f64,
    block: usize,
    fixed_ops: bool,
    check: bool,
    verbose: bool,
    shuffle: bool,
    clear: bool,
    stats: bool,
    dense: bool,
}

fn hash64(mut x: u64) -> u64 {
    // splitmix64
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

/// YCSB-style Zipfian generator, indexed by a hash so every thread can
/// draw from its own deterministic stream.
struct Zipfian {
    items: u64,
    theta: f64,
    zeta_n: f64,
    eta: f64,
    alpha: f64,
}

impl Zipfian {
    fn new(items: u64, theta: f64) -> Zipfian {
        assert!(items >= 2);
        let zeta = |n: u64| (1..=n).map(|i| 1.0 / (i as f64).powf(theta)).sum::<f64>();
        let zeta_2 = zeta(2);
        let zeta_n = zeta(items);
        Zipfian {
            items,
            theta,
            zeta_n,
            eta: (1.0 - (2.0 / items as f64).powf(1.0 - theta)) / (1.0 - zeta_2 / zeta_n),
            alpha: 1.0 / (1.0 - theta),
        }
    }

    fn sample(&self, i: u64) -> u64 {
        let u = hash64(i) as f64 / u64::MAX as f64;
        let uz = u * self.zeta_n;
        if uz < 1.0 {
            return 0;
        }
        if uz < 1.0 + 0.5f64.powf(self.theta) {
            return 1;
        }
        ((self.items - 1) as f64 * (self.eta * u - self.eta + 1.0).powf(self.alpha)).round()
            as u64
    }
}

/// The uniform surface the trial loop drives; one impl per structure.
trait BenchMap: Sync {
    fn find(&self, k: u64) -> Option<u64>;
    fn insert(&self, k: u64, v: u64) -> bool;
    fn remove(&self, k: u64) -> bool;
    fn check(&self) -> usize;
    fn clear(&mut self);
    fn shuffle(&self, n: usize);
    fn print_stats(&self);
}

impl BenchMap for ListMap<u64, u64> {
    fn find(&self, k: u64) -> Option<u64> {
        ListMap::find(self, &k)
    }
    fn insert(&self, k: u64, v: u64) -> bool {
        ListMap::insert(self, k, v)
    }
    fn remove(&self, k: u64) -> bool {
        ListMap::remove(self, &k)
    }
    fn check(&self) -> usize {
        ListMap::check(self)
    }
    fn clear(&mut self) {
        ListMap::clear(self)
    }
    fn shuffle(&self, n: usize) {
        ListMap::shuffle(self, n)
    }
    fn print_stats(&self) {
        println!("pool: {:?}", ListMap::stats(self));
    }
}

impl BenchMap for SnapList<u64, u64> {
    fn find(&self, k: u64) -> Option<u64> {
        SnapList::find(self, &k)
    }
    fn insert(&self, k: u64, v: u64) -> bool {
        SnapList::insert(self, k, v)
    }
    fn remove(&self, k: u64) -> bool {
        SnapList::remove(self, &k)
    }
    fn check(&self) -> usize {
        SnapList::check(self)
    }
    fn clear(&mut self) {
        SnapList::clear(self)
    }
    fn shuffle(&self, n: usize) {
        SnapList::shuffle(self, n)
    }
    fn print_stats(&self) {
        println!("pool: {:?}", SnapList::stats(self));
    }
}

impl BenchMap for hash::HashMap<u64, u64> {
    fn find(&self, k: u64) -> Option<u64> {
        hash::HashMap::find(self, &k)
    }
    fn insert(&self, k: u64, v: u64) -> bool {
        hash::HashMap::insert(self, k, v)
    }
    fn remove(&self, k: u64) -> bool {
        hash::HashMap::remove(self, &k)
    }
    fn check(&self) -> usize {
        hash::HashMap::check(self)
    }
    fn clear(&mut self) {
        hash::HashMap::clear(self)
    }
    fn shuffle(&self, n: usize) {
        hash::HashMap::shuffle(self, n)
    }
    fn print_stats(&self) {
        println!("pool: {:?}", hash::HashMap::stats(self));
    }
}

#[derive(Clone, Copy, Default)]
struct Counts {
    ops: u64,
    inserts: u64,
    removes: u64,
}

fn sanity_test<M: BenchMap>(map: &M) {
    for k in [3, 7, 1, 11] {
        map.insert(k, 123);
    }
    map.remove(3);
    assert_eq!(map.find(7), Some(123));
    assert_eq!(map.find(1), Some(123));
    assert_eq!(map.find(11), Some(123));
    assert_eq!(map.find(10), None);
    assert_eq!(map.find(3), None);
    println!("sanity checks passed");
}

/// Key `idx` of the key space: dense keys are `1..=space`, sparse keys
/// are spread over the full 64-bit range.
fn keygen(idx: u64, dense: bool) -> u64 {
    if dense {
        idx + 1
    } else {
        hash64(idx + 1) | 1
    }
}

fn mixed_trial<M: BenchMap>(map: &M, cfg: &Config, initial: usize, zipf: Option<&Zipfian>) {
    let space = 2 * cfg.n as u64;
    let start = Instant::now();
    let results: Vec<Counts> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..cfg.procs)
            .map(|tid| {
                scope.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(0x8000 + tid as u64);
                    // private index stream for the zipfian generator
                    let mut op_i = (tid as u64) << 40;
                    let mut local = Counts::default();
                    let deadline = start + Duration::from_secs_f64(cfg.trial_time);
                    while Instant::now() < deadline {
                        // one epoch announcement per block
                        with_epoch(|| {
                            for _ in 0..cfg.block {
                                let idx = match zipf {
                                    Some(z) => z.sample(op_i),
                                    None => rng.gen_range(0..space),
                                };
                                op_i += 1;
                                let key = keygen(idx, cfg.dense);
                                let dice = rng.gen_range(0..100u64);
                                if dice < cfg.update_percent / 2 {
                                    if map.insert(key, key.wrapping_add(1)) {
                                        local.inserts += 1;
                                    }
                                } else if dice < cfg.update_percent {
                                    if map.remove(key) {
                                        local.removes += 1;
                                    }
                                } else {
                                    std::hint::black_box(map.find(key));
                                }
                                local.ops += 1;
                            }
                        });
                    }
                    local
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    let elapsed = start.elapsed().as_secs_f64();

    let mut total = Counts::default();
    for (tid, c) in results.iter().enumerate() {
        if cfg.verbose {
            println!(
                "thread {}: {} ops, {} inserts, {} removes",
                tid, c.ops, c.inserts, c.removes
            );
        }
        total.ops += c.ops;
        total.inserts += c.inserts;
        total.removes += c.removes;
    }

    println!(
        "n={} p={} u={} z={}: {:.2} Mop/s",
        cfg.n,
        cfg.procs,
        cfg.update_percent,
        cfg.zipfian,
        total.ops as f64 / elapsed / 1e6
    );

    if cfg.check {
        let expected = initial as u64 + total.inserts - total.removes;
        let actual = map.check() as u64;
        if actual != expected {
            eprintln!("bench: check failed: size {} expected {}", actual, expected);
            std::process::exit(1);
        }
    }
}

fn fixed_op_trial<M: BenchMap>(map: &M, cfg: &Config) {
    let per_thread = cfg.n / cfg.procs.max(1);
    let start = Instant::now();
    std::thread::scope(|scope| {
        for tid in 0..cfg.procs {
            scope.spawn(move || {
                let lo = (tid * per_thread) as u64;
                let hi = lo + per_thread as u64;
                for i in lo..hi {
                    assert!(map.insert(keygen(i, cfg.dense), i));
                }
                for i in lo..hi {
                    assert!(map.find(keygen(i, cfg.dense)).is_some());
                }
                for i in lo..hi {
                    assert!(map.remove(keygen(i, cfg.dense)));
                }
            });
        }
    });
    let elapsed = start.elapsed().as_secs_f64();
    let ops = 3 * per_thread as u64 * cfg.procs as u64;
    println!(
        "insert_find_delete n={} p={}: {:.2} Mop/s",
        cfg.n,
        cfg.procs,
        ops as f64 / elapsed / 1e6
    );
    if cfg.check {
        let size = map.check();
        if size != 0 {
            eprintln!("bench: check failed: {} keys left after deletes", size);
            std::process::exit(1);
        }
    }
}

fn run<M: BenchMap, F: Fn() -> M>(make: F, cfg: &Config) {
    let zipf = if cfg.zipfian != 0.0 {
        Some(Zipfian::new(2 * cfg.n as u64, cfg.zipfian))
    } else {
        None
    };

    for round in 0..cfg.rounds {
        if cfg.verbose {
            println!("round {}", round);
        }
        let mut map = make();
        if cfg.shuffle {
            map.shuffle(cfg.n);
        }

        if cfg.fixed_ops {
            fixed_op_trial(&map, cfg);
        } else {
            // preload n of the 2n keys
            let mut initial = 0;
            for i in 0..cfg.n as u64 {
                if map.insert(keygen(2 * i, cfg.dense), i) {
                    initial += 1;
                }
            }
            mixed_trial(&map, cfg, initial, zipf.as_ref());
        }

        if cfg.stats {
            map.print_stats();
        }
        if cfg.clear {
            map.clear();
        }
    }
}

fn main() {
    let cl = CommandLine {
        args: std::env::args().skip(1).collect(),
    };

    let threads = std::thread::available_parallelism().map_or(1, |p| p.get());
    let cfg = Config {
        n: cl.value("-n", 100_000usize),
        procs: cl.value("-p", threads),
        rounds: cl.value("-r", 1usize),
        update_percent: cl.value("-u", 20u64),
        zipfian: cl.value("-z", 0.0f64),
        trial_time: cl.value("-tt", cl.value("-t", 1.0f64)),
        block: cl.value("-b", 1usize).max(1),
        fixed_ops: cl.flag("-insert_find_delete"),
        check: !cl.flag("-no_check"),
        verbose: cl.flag("-v") || cl.flag("-verbose"),
        shuffle: cl.flag("-shuffle"),
        clear: cl.flag("-clear"),
        stats: cl.flag("-stats"),
        dense: cl.flag("-dense"),
    };
    if cl.flag("-strict_lock") {
        // the shipped maps are try-lock only; accepted for flag parity
        eprintln!("bench: -strict_lock has no effect (try locks only)");
    }

    let ds = cl.string("-ds", "list");
    match ds.as_str() {
        "list" => {
            if cl.flag("-i") {
                sanity_test(&ListMap::<u64, u64>::new());
            }
            run(ListMap::<u64, u64>::new, &cfg);
        }
        "snaplist" => {
            if cl.flag("-i") {
                sanity_test(&SnapList::<u64, u64>::new());
            }
            run(SnapList::<u64, u64>::new, &cfg);
        }
        "hash" => {
            if cl.flag("-i") {
                sanity_test(&hash::HashMap::<u64, u64>::new(16));
            }
            run(|| hash::HashMap::<u64, u64>::new(cfg.n), &cfg);
        }
        other => {
            eprintln!("bench: unknown structure {:?} (-ds list|snaplist|hash)", other);
            std::process::exit(1);
        }
    }
}
