mod common;

use common::SimHost;
use frame_hook::{Candidate, CandidateSet, HookError, MatchKind, Resolver, Value, config::{self, logical}};

fn resolver() -> Resolver { Resolver::new(config::default_candidates()) }

#[test]
fn root_comes_from_the_first_loaded_accessor() {
  let host = SimHost::new();
  let resolver = resolver();

  let root = resolver.resolve_root(logical::ROOT, host.as_ref()).unwrap();
  assert_eq!(root.candidate_index(), 2);
  assert_eq!(root.provenance().member, "ave.A");
  assert_eq!(Value::Object(root.instance().unwrap()), Value::Object(host.root()));
}

#[test]
fn obfuscated_player_field_is_a_fallback() {
  let host = SimHost::new();
  let resolver = resolver();

  let player = resolver.resolve(logical::PLAYER, &host.root()).unwrap();
  assert_eq!(player.candidate_index(), 2);
  assert_eq!(player.provenance().to_string(), "h (structural/name fallback)");
  assert_eq!(player.field().unwrap().get().unwrap(), Value::Str("player".to_string()));
}

#[test]
fn structural_candidate_finds_the_renamed_font() {
  let host = SimHost::new();
  let resolver = resolver();

  // Only the declared type "avn" leaks through.
  let set = CandidateSet::new(logical::FONT, vec![Candidate::field("fontRendererObj"), Candidate::field("field_71466_p"), Candidate::field_type("FontRenderer"), Candidate::field_type("avn")]);
  let font = resolver.resolve_with(&set, &host.root()).unwrap();
  assert_eq!(font.candidate_index(), 3);
  assert_eq!(font.provenance().kind, MatchKind::Fallback);
  assert_eq!(font.field().unwrap().name(), "k");
}

#[test]
fn exhausted_candidates_are_not_found() {
  let host = SimHost::new();
  let resolver = Resolver::default();
  let set = CandidateSet::new("world", vec![Candidate::field("theWorld"), Candidate::field("f"), Candidate::field_type("WorldClient"), Candidate::method_params(&["double", "double"])]);

  match resolver.resolve_with(&set, &host.root()) {
    Err(HookError::NotFound { logical }) => assert_eq!(logical, "world"),
    other => panic!("expected NotFound, got {other:?}"),
  }
  assert!(matches!(resolver.resolve("unregistered", &host.root()), Err(HookError::NotFound { .. })));
}

#[test]
fn invalidation_turns_handles_stale() {
  let host = SimHost::new();
  let resolver = resolver();

  let hud = resolver.resolve(logical::HUD, &host.root()).unwrap();
  assert!(hud.field().is_ok());

  resolver.invalidate();
  assert!(!hud.is_valid());
  assert!(matches!(hud.field().and_then(|f| f.get()), Err(HookError::StaleHandle { .. })));

  let fresh = resolver.resolve(logical::HUD, &host.root()).unwrap();
  assert!(fresh.is_valid());
  assert_eq!(fresh.field().unwrap().name(), "q");
}
