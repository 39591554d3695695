mod common;

use common::{BASE, RENDER_BODY, Recorder, SimHost, config, wait_until};
use frame_hook::{
  Coordinator, HookError, ImageLoader, ImageMemory, LifecycleState, Memory, StrategyKind, TeardownReport, Value,
  host::same_object,
};
use parking_lot::Mutex;
use std::{
  sync::{Arc, atomic::{AtomicUsize, Ordering}},
  thread,
  time::Duration,
};

const SETTLE: Duration = Duration::from_secs(3);

fn code(coordinator: &Coordinator) -> (Arc<ImageMemory>, Arc<ImageLoader>) {
  let memory = Arc::new(ImageMemory::new());
  let mut image = vec![0xCC; 0x100];
  image[0x10..0x10 + RENDER_BODY.len()].copy_from_slice(&RENDER_BODY);
  memory.map(BASE, image).unwrap();
  let loader = Arc::new(ImageLoader::new(memory.clone()));
  coordinator.attach_code_loader(loader.clone(), memory.clone());
  (memory, loader)
}

fn unload_counter(coordinator: &Coordinator) -> Arc<AtomicUsize> {
  let unloaded = Arc::new(AtomicUsize::new(0));
  let u = unloaded.clone();
  coordinator.on_unload(move || {
    u.fetch_add(1, Ordering::SeqCst);
  });
  unloaded
}

#[test]
fn substitution_lifecycle_round_trip() {
  let host = SimHost::new();
  host.start();
  let original = host.hud();

  let coordinator = Coordinator::new(config(StrategyKind::Substitution), host.clone());
  let unloaded = unload_counter(&coordinator);
  coordinator.overlays().register(Arc::new(Recorder { name: "hud_text", events: host.event_sink() }));

  let record = coordinator.activate().unwrap();
  assert_eq!(coordinator.state(), LifecycleState::Active);
  assert_eq!(record.strategy(), StrategyKind::Substitution);
  assert!(coordinator.bridge().is_published());
  assert_eq!(host.title().as_deref(), Some("Minecraft 1.8.9 - Injected"));
  assert!(!same_object(&host.hud(), &original));

  assert!(wait_until(SETTLE, || record.is_triggered()));
  assert!(wait_until(SETTLE, || host.events().iter().any(|e| e == "overlay:hud_text")));
  assert!(coordinator.activate().is_err());

  let report = coordinator.shutdown().unwrap();
  assert!(!report.timed_out);
  assert!(report.unloaded);
  assert_eq!(report.restore.restored, ["substitution:hud", "window_title"]);

  assert_eq!(coordinator.state(), LifecycleState::Inactive);
  assert!(same_object(&host.hud(), &original));
  assert_eq!(host.title().as_deref(), Some("Minecraft 1.8.9"));
  assert!(!coordinator.bridge().is_published());
  assert!(coordinator.context().is_none());
  assert!(coordinator.overlays().is_empty());
  assert_eq!(unloaded.load(Ordering::SeqCst), 1);

  // A second shutdown has nothing left to do.
  assert_eq!(coordinator.shutdown().unwrap(), TeardownReport::default());
  host.stop();
}

#[test]
fn keybinds_toggle_overlays_and_unload() {
  let host = SimHost::new();
  host.start();
  let coordinator = Coordinator::new(config(StrategyKind::Substitution), host.clone());
  let unloaded = unload_counter(&coordinator);
  coordinator.activate().unwrap();
  let keys = coordinator.config().keys.clone();

  host.press(keys.toggle_overlay);
  assert!(wait_until(SETTLE, || !coordinator.overlays().is_visible()));
  host.release(keys.toggle_overlay);

  host.press(keys.unload);
  assert!(wait_until(SETTLE, || unloaded.load(Ordering::SeqCst) == 1));
  host.release(keys.unload);

  assert_eq!(coordinator.state(), LifecycleState::Inactive);
  assert_eq!(host.title().as_deref(), Some("Minecraft 1.8.9"));
  host.stop();
}

#[test]
fn bridge_reaches_the_coordinator_from_outside() {
  let host = SimHost::new();
  host.start();
  let coordinator = Coordinator::new(config(StrategyKind::Substitution), host.clone());
  let unloaded = unload_counter(&coordinator);
  coordinator.activate().unwrap();

  // Whoever holds the bridge only sees the key and the one request it may make.
  let bridge = coordinator.bridge().clone();
  assert_eq!(bridge.key(), "frame_hook.destruct");
  assert!(bridge.request_teardown());
  assert!(!bridge.request_teardown());

  assert!(wait_until(SETTLE, || unloaded.load(Ordering::SeqCst) == 1));
  assert_eq!(coordinator.state(), LifecycleState::Inactive);
  host.stop();
}

#[test]
fn transformation_patches_and_restores_code() {
  let host = SimHost::new();
  host.start();
  let coordinator = Coordinator::new(config(StrategyKind::Transformation), host.clone());
  let (memory, loader) = code(&coordinator);
  loader.load("avo", BASE, 0x100).unwrap();

  let record = coordinator.activate().unwrap();
  assert_eq!(record.strategy(), StrategyKind::Transformation);
  assert!(record.is_triggered());
  assert!(!loader.is_pristine("avo").unwrap());
  // Discovery retires once the first unit is patched.
  assert_eq!(loader.rewriter_count(), 0);

  let transformer = coordinator.transformer().unwrap();
  assert_eq!(transformer.patch_points("avo").len(), 2);
  let context = transformer.context("notch").unwrap();
  assert!(!context.should_return());

  coordinator.overlays().register(Arc::new(Recorder { name: "esp", events: host.event_sink() }));
  context.run_logic();
  assert!(host.events().iter().any(|e| e == "overlay:esp@notch"));

  let report = coordinator.shutdown().unwrap();
  assert_eq!(report.restore.restored, ["transformation:frame_render", "window_title"]);
  assert!(loader.is_pristine("avo").unwrap());
  assert!(transformer.is_clean());
  assert!(context.should_return());
  assert_eq!(memory.read(BASE + 0x10, RENDER_BODY.len()).unwrap(), RENDER_BODY);
  host.stop();
}

#[test]
fn emergency_key_inside_the_patched_method_tears_down() {
  let host = SimHost::new();
  host.start();
  let coordinator = Coordinator::new(config(StrategyKind::Transformation), host.clone());
  let (_memory, loader) = code(&coordinator);
  let unloaded = unload_counter(&coordinator);
  coordinator.activate().unwrap();

  // Loaded after activation, picked up by the live rewriter.
  loader.load("avo", BASE, 0x100).unwrap();
  let context = coordinator.transformer().unwrap().context("notch").unwrap();

  host.press(coordinator.config().keys.emergency_unload);
  assert!(context.should_return());
  assert!(wait_until(SETTLE, || unloaded.load(Ordering::SeqCst) == 1));
  host.release(coordinator.config().keys.emergency_unload);

  assert_eq!(coordinator.state(), LifecycleState::Inactive);
  assert!(loader.is_pristine("avo").unwrap());
  host.stop();
}

#[test]
fn installing_over_an_incumbent_removes_it_first() {
  let host = SimHost::new();
  host.start();
  let original = host.hud();
  let coordinator = Coordinator::new(config(StrategyKind::Substitution), host.clone());
  let (_memory, loader) = code(&coordinator);
  loader.load("avo", BASE, 0x100).unwrap();

  coordinator.activate().unwrap();
  assert!(!same_object(&host.hud(), &original));

  let record = coordinator.install(StrategyKind::Transformation).unwrap();
  assert_eq!(coordinator.hook("frame_render").unwrap().strategy(), StrategyKind::Transformation);
  assert!(record.is_triggered());
  assert!(same_object(&host.hud(), &original));
  assert_eq!(coordinator.context().unwrap().ledger().names(), ["window_title", "transformation:frame_render"]);

  coordinator.shutdown().unwrap();
  assert!(loader.is_pristine("avo").unwrap());
  host.stop();
}

#[test]
fn transformation_needs_a_code_loader() {
  let host = SimHost::new();
  host.start();
  let coordinator = Coordinator::new(config(StrategyKind::Transformation), host.clone());

  assert!(matches!(coordinator.activate(), Err(HookError::InvalidState(_))));
  // Rolled back: the title mutation is undone and the bridge withdrawn.
  assert_eq!(coordinator.state(), LifecycleState::Inactive);
  assert_eq!(host.title().as_deref(), Some("Minecraft 1.8.9"));
  assert!(!coordinator.bridge().is_published());
  host.stop();
}

#[test]
fn shutdown_proceeds_when_the_host_is_stuck() {
  let host = SimHost::new();
  host.start();
  let original = host.hud();
  let mut config = config(StrategyKind::Substitution);
  config.timings.shutdown_ms = 300;
  let coordinator = Coordinator::new(config, host.clone());
  let unloaded = unload_counter(&coordinator);
  coordinator.activate().unwrap();

  let ran_on = Arc::new(Mutex::new(None));
  let r = ran_on.clone();
  let h = host.clone();
  coordinator.context().unwrap().ledger().register("thread_check", move || {
    *r.lock() = Some(thread::current().id() == h.host_thread().unwrap());
    Ok(())
  });

  host.set_stalled(true);
  let report = coordinator.shutdown().unwrap();
  assert!(report.timed_out);
  assert!(report.unloaded);
  assert_eq!(coordinator.state(), LifecycleState::Inactive);
  assert_eq!(unloaded.load(Ordering::SeqCst), 1);

  // Nothing was undone from the tearing-down thread.
  assert_eq!(*ran_on.lock(), None);
  assert!(!same_object(&host.hud(), &original));
  assert_eq!(host.title().as_deref(), Some("Minecraft 1.8.9 - Injected"));

  // The queued restore finishes the job once the host thread recovers.
  host.set_stalled(false);
  assert!(wait_until(SETTLE, || ran_on.lock().is_some()));
  assert_eq!(*ran_on.lock(), Some(true));
  assert!(wait_until(SETTLE, || host.title().as_deref() == Some("Minecraft 1.8.9")));
  assert!(same_object(&host.hud(), &original));
  host.stop();
  assert_eq!(host.root().get_field("q").unwrap(), Value::Object(original));
}

#[test]
fn activation_that_runs_late_patches_nothing() {
  let host = SimHost::new();
  host.start();
  let mut config = config(StrategyKind::Transformation);
  config.timings.shutdown_ms = 300;
  let coordinator = Coordinator::new(config, host.clone());
  let (_memory, loader) = code(&coordinator);
  loader.load("avo", BASE, 0x100).unwrap();

  host.set_stalled(true);
  assert!(matches!(coordinator.activate(), Err(HookError::TimedOut { .. })));
  assert_eq!(coordinator.state(), LifecycleState::Inactive);

  // Let the host drain the title, activation and restore tasks queued while it was stuck.
  host.set_stalled(false);
  let frames = host.frames();
  assert!(wait_until(SETTLE, || host.frames() > frames + 2));

  assert!(loader.is_pristine("avo").unwrap());
  assert_eq!(loader.rewriter_count(), 0);
  assert_eq!(host.title().as_deref(), Some("Minecraft 1.8.9"));
  host.stop();
}

#[test]
fn unresolvable_host_fails_activation() {
  let host = SimHost::new();
  host.start();
  let mut config = config(StrategyKind::Substitution);
  config.candidates.retain(|set| set.logical != "root");
  let coordinator = Coordinator::new(config, host.clone());

  assert!(matches!(coordinator.activate(), Err(HookError::NotFound { .. })));
  assert_eq!(coordinator.state(), LifecycleState::Inactive);
  assert!(!coordinator.request_teardown());
  host.stop();
}
