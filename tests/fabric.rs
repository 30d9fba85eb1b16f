use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use vpsim::addr::AddrSpace;
use vpsim::devices::Memory;
use vpsim::interconnect::{Bus, Transport};
use vpsim::iss::abi::{RW_OK, RW_READ};
use vpsim::iss::ClosureBackend;
use vpsim::param::{Modifier, ModuleKind, ParamManager, Parameter, ParameterSet, Sign};
use vpsim::payload::{Command, Payload};
use vpsim::target::{LatencyModel, TargetIf, TargetSocket};
use vpsim::{Platform, PlatformConfig, SimTime};

fn random_space(rng: &mut StdRng, limit: u64) -> AddrSpace {
    let base = rng.gen_range(0..limit);
    let size = rng.gen_range(1..=limit / 4);
    AddrSpace::from_size(base, size).unwrap()
}

fn random_set(rng: &mut StdRng, limit: u64) -> ParameterSet {
    let mut set = ParameterSet::new();
    for _ in 0..rng.gen_range(0..6) {
        let space = random_space(rng, limit);
        let value = match rng.gen_range(0..3) {
            0 => Parameter::blocking(rng.gen()),
            1 => Parameter::delay(SimTime::from_ns(rng.gen_range(0..4))),
            _ => Parameter::traversal_rate(0.5).unwrap(),
        };
        set.set(space, value).unwrap();
    }
    set
}

#[test]
fn test_unreachable_addresses_read_default() {
    let pm = ParamManager::new();
    let mem = |name: &str, base: u64| {
        let m = Arc::new(Mutex::new(Memory::new(name, 0x1000, false, true).unwrap()));
        let tif = TargetIf { base, size: 0x1000, latency: LatencyModel::none() };
        Arc::new(TargetSocket::new(&pm, tif, m).unwrap())
    };
    let a = mem("a", 0x0);
    let b = mem("b", 0x4000);
    pm.set_parameter(a.module(), None, Parameter::blocking(false)).unwrap();
    pm.set_parameter(b.module(), None, Parameter::blocking(false)).unwrap();

    let mut bus = Bus::new(&pm, "bus", SimTime::ZERO).unwrap();
    bus.map(a.space(), a.clone()).unwrap();
    bus.map(b.space(), b.clone()).unwrap();
    let bus = Arc::new(bus);
    let cpu = pm.register("cpu", ModuleKind::Dummy, None).unwrap();
    pm.add_successor(cpu.id(), bus.module(), 0).unwrap();

    let through_a = pm.effective(bus.module(), 0);
    assert!(!through_a.blocking_enabled(0x10));
    assert!(through_a.blocking_enabled(0x4010));
    let through_b = pm.effective(bus.module(), 1);
    assert!(through_b.blocking_enabled(0x10));
    assert!(!through_b.blocking_enabled(0x4010));

    let seen = pm.exported(cpu.id());
    let mut rng = StdRng::seed_from_u64(1);
    for _ in 0..1000 {
        let addr = rng.gen_range(0..0x1_0000u64);
        let mapped = a.space().contains(addr) || b.space().contains(addr);
        assert_eq!(seen.blocking_enabled(addr), !mapped, "at 0x{:x}", addr);
    }
}

#[test]
fn test_set_over_pieces_equals_set_over_union() {
    let mut rng = StdRng::seed_from_u64(2);
    for _ in 0..500 {
        let base = random_set(&mut rng, 0x1000);
        let s1 = random_space(&mut rng, 0x1000);
        // s2 overlaps or touches s1 so that the union is one space
        let start = rng.gen_range(s1.base()..=s1.end() + 1);
        let s2 = AddrSpace::from_size(start, rng.gen_range(1..0x400)).unwrap();
        let union = AddrSpace::new(s1.base().min(s2.base()), s1.end().max(s2.end())).unwrap();
        let v = Parameter::delay(SimTime::from_ns(rng.gen_range(0..4)));

        let mut pieces = base.clone();
        pieces.set(s1, v).unwrap();
        pieces.set(s2, v).unwrap();
        let mut whole = base.clone();
        whole.set(union, v).unwrap();
        assert_eq!(pieces, whole);
    }
}

#[test]
fn test_set_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(3);
    for _ in 0..500 {
        let mut once = random_set(&mut rng, 0x1000);
        let space = random_space(&mut rng, 0x1000);
        let v = Parameter::blocking(rng.gen());
        once.set(space, v).unwrap();
        let mut twice = once.clone();
        twice.set(space, v).unwrap();
        assert_eq!(once, twice);
    }
}

#[test]
fn test_intersection_is_symmetric() {
    let mut rng = StdRng::seed_from_u64(4);
    for _ in 0..1000 {
        let a = random_space(&mut rng, 0x1000);
        let b = random_space(&mut rng, 0x1000);
        assert_eq!(a.intersects(&b), b.intersects(&a));
        assert_eq!(a.intersection(&b), b.intersection(&a));
    }
}

#[test]
fn test_translators_cancel_out() {
    let mut rng = StdRng::seed_from_u64(5);
    for _ in 0..500 {
        let set = random_set(&mut rng, 0x1_0000);
        let k = rng.gen_range(0..1u64 << 40);
        let up = Modifier::translator(k, Sign::Plus).apply_params(&set).unwrap();
        let back = Modifier::translator(k, Sign::Minus).apply_params(&up).unwrap();
        assert_eq!(back, set);
    }
}

const RAM_SOC: &str = r#"
[[cpus]]
name = "cpu0"

[[memories]]
name = "ram"
base = 0x0
size = 0x10_0000

[[parameters]]
module = "ram"
value = { blocking_tlm_enabled = "disabled" }
"#;

#[test]
fn test_dmi_fast_path() {
    let cfg: PlatformConfig = RAM_SOC.parse().unwrap();
    let mut vp = Platform::from_config(&cfg).unwrap();
    {
        let mut ram = vp.memory("ram").unwrap().memory.lock();
        ram.load_bytes(0x1000, &0x1111u64.to_le_bytes()).unwrap();
        ram.load_bytes(0x1008, &0x2222u64.to_le_bytes()).unwrap();
    }
    let read = Arc::new(Mutex::new(Vec::new()));
    let r2 = read.clone();
    vp.cpus()[0]
        .attach(ClosureBackend::new(move |cpu, _| {
            for addr in [0x1000, 0x1008] {
                let mut v = 0;
                assert_eq!(cpu.rwsync(addr, RW_READ, 1, 8, &mut v), RW_OK);
                r2.lock().push((v, cpu.stats()));
            }
            Ok(())
        }))
        .unwrap();
    vp.run().unwrap();

    let read = read.lock();
    assert_eq!(read[0].0, 0x1111);
    assert_eq!((read[0].1.dmi_queries, read[0].1.direct, read[0].1.blocking), (1, 1, 0));
    assert_eq!(read[1].0, 0x2222);
    // second access reuses the grant without touching the bus
    assert_eq!((read[1].1.dmi_queries, read[1].1.direct, read[1].1.blocking), (1, 2, 0));
}

#[test]
fn test_mid_run_dmi_flip() {
    let text = format!(
        "{}{}",
        RAM_SOC,
        r#"
[[parameters]]
module = "ram"
value = { approximate_delay = "20 ns" }

[[appointments]]
module = "ram"
date = "1 ms"
value = { blocking_tlm_enabled = "enabled" }
"#
    );
    let cfg: PlatformConfig = text.parse().unwrap();
    let mut vp = Platform::from_config(&cfg).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let l2 = log.clone();
    vp.cpus()[0]
        .attach(ClosureBackend::new(move |cpu, _| {
            let mut v = 0;
            let t0 = cpu.local_time();
            cpu.rwsync(0x1000, RW_READ, 0, 8, &mut v);
            l2.lock().push((cpu.stats(), cpu.local_time() - t0));
            // 1.5 ms of instructions, past the appointment
            cpu.fsync(0, 1_500_000, 1000, false);
            let t1 = cpu.local_time();
            cpu.rwsync(0x1008, RW_READ, 0, 8, &mut v);
            l2.lock().push((cpu.stats(), cpu.local_time() - t1));
            Ok(())
        }))
        .unwrap();
    vp.run().unwrap();

    let log = log.lock();
    let (before, d0) = log[0];
    assert_eq!((before.direct, before.blocking), (1, 0));
    assert_eq!(d0, SimTime::from_ns(20));
    let (after, d1) = log[1];
    assert_eq!((after.direct, after.blocking), (1, 1));
    // one memory cycle plus the approximate delay
    assert_eq!(d1, SimTime::from_ns(21));

    let ram = &vp.memory("ram").unwrap().socket;
    let mut query = Payload::dmi_query(0x1000, Command::Read, 0);
    let mut delay = SimTime::ZERO;
    assert!(ram.b_transport(&mut query, &mut delay).is_ok());
    assert!(!query.dmi);
}
