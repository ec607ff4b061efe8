#![no_main]

use callprof::{Entity, ProfileConfig, ProfileEvent, ProfileSession};
use libfuzzer_sys::fuzz_target;

const MEMBERS: [&str; 4] = ["a", "b", "c", "d"];

fuzz_target!(|data: &[u8]| {
    let mut session = match ProfileSession::new(ProfileConfig {
        track_allocations: true,
        ..ProfileConfig::default()
    }) {
        Ok(session) => session,
        Err(_) => return,
    };
    let _ = session.exclude_method(&Entity::Plain("F".into()), "d");
    if session.start_at(0.0).is_err() {
        return;
    }

    // Each byte pair is one event: kind/member selector plus thread selector
    let mut now = 0.0;
    for chunk in data.chunks(2) {
        let selector = chunk[0];
        let thread = chunk.get(1).copied().unwrap_or(0) as u64 % 4;
        now += f64::from(selector & 0x0f);
        let member = MEMBERS[usize::from(selector >> 6)];
        let event = match selector % 8 {
            0 | 1 => ProfileEvent::call(Entity::Plain("F".into()), member).source("f.rb", 1),
            2 => ProfileEvent::native_call(Entity::InstanceSingleton("F".into()), member),
            3 | 4 => ProfileEvent::ret(),
            5 => ProfileEvent::line("f.rb", u32::from(selector)),
            6 => ProfileEvent::allocation("Obj", u64::from(selector), "f.rb", 2),
            _ => {
                let _ = if selector & 0x10 == 0 {
                    session.pause_at(now)
                } else {
                    session.resume_at(now)
                };
                continue;
            }
        };
        let _ = session.handle_event(&event.on(thread, u64::from(selector & 1)).at(now));
    }

    // Should never panic, and stop must settle everything
    let _ = session.stop_at(now);
    for (_, context) in session.threads() {
        assert!(context.stack().is_empty());
    }
    let _ = session.merge_fibers();
    if let Ok(json) = session.dump().to_json() {
        let _ = callprof::ProfileDump::from_json(&json).and_then(|d| d.into_session());
    }
});
