use std::sync::Arc;
use std::thread;

use conductor_profiles::{AutoSwitchPolicy, NewProfile, ProfileRegistry};
use conductor_protocol::ids::ProfileId;

fn registry(count: usize) -> Arc<ProfileRegistry> {
    let registry = Arc::new(ProfileRegistry::default());
    for index in 0..count {
        registry
            .register(NewProfile::new(format!("profile-{index}").as_str(), format!("Profile {index}")))
            .expect("register");
    }
    registry
}

#[test]
fn concurrent_set_active_leaves_exactly_one_active_profile() {
    let registry = registry(6);

    let workers: Vec<_> = (0..12)
        .map(|worker| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for round in 0..50 {
                    let target = ProfileId::new(format!("profile-{}", (worker + round) % 6));
                    registry.set_active(&target).expect("set active");
                    let listed = registry.list().expect("list");
                    assert_eq!(listed.iter().filter(|profile| profile.active).count(), 1);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    let listed = registry.list().expect("list");
    assert_eq!(listed.iter().filter(|profile| profile.active).count(), 1);
    let active = registry.active_id().expect("active").expect("some active");
    assert!(listed.iter().any(|profile| profile.id == active && profile.active));
}

#[test]
fn best_available_excludes_the_active_profile_while_it_changes() {
    let registry = registry(3);
    let policy = AutoSwitchPolicy::default();

    let switcher = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            for round in 0..200 {
                let target = ProfileId::new(format!("profile-{}", round % 3));
                registry.set_active(&target).expect("set active");
            }
        })
    };

    for _ in 0..200 {
        assert!(registry.best_available(&policy).expect("best").is_some());
    }
    switcher.join().expect("switcher panicked");

    let active = registry.active_id().expect("active");
    let best = registry.best_available(&policy).expect("best");
    assert_ne!(best, active);
}
