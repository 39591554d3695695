use crate::{
  coordinator::StrategyKind,
  error::Result,
  patch::{Dialect, MethodSignature, PatchTable, TargetUnit},
  resolver::{Candidate, CandidateSet},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

/// Logical names the crate resolves.
pub mod logical {
  pub const ROOT: &str = "root";
  pub const HUD: &str = "hud";
  pub const FONT: &str = "font";
  pub const PLAYER: &str = "player";
  pub const SCHEDULE_TASK: &str = "schedule_task";
  pub const RENDER_ENTRY: &str = "render_entry";
}

/// LWJGL key codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConfig {
  pub unload: i32,         // period
  pub toggle_overlay: i32, // right shift
  /// Polled from inside the patched render method, right shift by default.
  pub emergency_unload: i32,
}

impl Default for KeyConfig {
  fn default() -> Self { Self { unload: 52, toggle_overlay: 54, emergency_unload: 54 } }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
  /// Keybind poll period, one host tick.
  pub tick_ms: u64,
  /// Delay between a teardown request and the teardown itself.
  pub grace_ms: u64,
  /// Upper bound on waiting for the host thread to run the restore.
  pub shutdown_ms: u64,
}

impl Default for TimingConfig {
  fn default() -> Self { Self { tick_ms: 50, grace_ms: 100, shutdown_ms: 3000 } }
}

impl TimingConfig {
  pub fn tick(&self) -> Duration { Duration::from_millis(self.tick_ms) }

  pub fn grace(&self) -> Duration { Duration::from_millis(self.grace_ms) }

  pub fn shutdown(&self) -> Duration { Duration::from_millis(self.shutdown_ms) }
}

fn default_title_suffix() -> String { " - Injected".to_string() }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
  pub version: u32,
  pub strategy: StrategyKind,
  pub bridge_key: String,
  #[serde(default = "default_title_suffix")]
  pub window_title_suffix: String,
  /// Field on the root object whose value is substituted.
  pub hook_field: String,
  #[serde(default)]
  pub keys: KeyConfig,
  #[serde(default)]
  pub timings: TimingConfig,
  pub candidates: Vec<CandidateSet>,
  pub patch: PatchTable,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      version: 1,
      strategy: StrategyKind::Substitution,
      bridge_key: "frame_hook.destruct".to_string(),
      window_title_suffix: default_title_suffix(),
      hook_field: logical::HUD.to_string(),
      keys: KeyConfig::default(),
      timings: TimingConfig::default(),
      candidates: default_candidates(),
      patch: default_patch_table(),
    }
  }
}

/// Minecraft 1.8.9: MCP names first, then SRG, then the obfuscated ones, then structure.
pub fn default_candidates() -> Vec<CandidateSet> {
  const RUNNABLE: &[&str] = &["java.lang.Runnable"];
  const PARTIAL_TICKS: &[&str] = &["float"];

  vec![
    CandidateSet::new(logical::ROOT, vec![Candidate::accessor("net.minecraft.client.Minecraft", "getMinecraft"), Candidate::accessor("net.minecraft.client.Minecraft", "func_71410_x"), Candidate::accessor("ave", "A")]),
    CandidateSet::new(logical::HUD, vec![Candidate::field("ingameGUI"), Candidate::field("field_71456_v"), Candidate::field("q"), Candidate::field_type("GuiIngame"), Candidate::field_type("avo")]),
    CandidateSet::new(logical::FONT, vec![Candidate::field("fontRendererObj"), Candidate::field("field_71466_p"), Candidate::field("k"), Candidate::field_type("FontRenderer"), Candidate::field_type("avn")]),
    CandidateSet::new(logical::PLAYER, vec![Candidate::field("thePlayer"), Candidate::field("field_71439_g"), Candidate::field("h"), Candidate::field_type("EntityPlayerSP"), Candidate::field_type("bew")]),
    CandidateSet::new(logical::SCHEDULE_TASK, vec![Candidate::method("addScheduledTask", RUNNABLE), Candidate::method("func_152344_a", RUNNABLE), Candidate::method("a", RUNNABLE), Candidate::method_params(RUNNABLE)]),
    CandidateSet::new(logical::RENDER_ENTRY, vec![Candidate::method("renderGameOverlay", PARTIAL_TICKS), Candidate::method("func_175180_a", PARTIAL_TICKS), Candidate::method("a", PARTIAL_TICKS)]),
  ]
}

pub fn default_patch_table() -> PatchTable {
  let unit = |name: &str, dialect: &str| TargetUnit { name: name.to_string(), dialect: dialect.to_string() };

  PatchTable {
    point: "frame_render".to_string(),
    units: vec![unit("avo", "notch"), unit("net/minecraft/client/gui/GuiIngame", "mcp"), unit("net/minecraft/client/gui/hud/InGameHud", "yarn")],
    methods: vec![
      MethodSignature { name: "renderGameOverlay".to_string(), pattern: "48 89 5C 24 ?? 48 89 74 24 ?? 57 48 83 EC ?? 0F 29 74 24 ??".to_string(), max_len: 0x400 },
      MethodSignature { name: "func_175180_a".to_string(), pattern: "40 53 48 83 EC ?? 0F 29 74 24 ?? 48 8B D9".to_string(), max_len: 0x400 },
    ],
    dialects: vec![
      Dialect::new("notch").with_symbol(logical::ROOT, "ave").with_symbol(logical::FONT, "k").with_symbol("draw_string", "a"),
      Dialect::new("mcp").with_symbol(logical::ROOT, "net/minecraft/client/Minecraft").with_symbol(logical::FONT, "fontRendererObj").with_symbol("draw_string", "drawStringWithShadow"),
      Dialect::new("yarn").with_symbol(logical::ROOT, "net/minecraft/client/MinecraftClient").with_symbol(logical::FONT, "textRenderer").with_symbol("draw_string", "drawWithShadow"),
    ],
  }
}

impl Config {
  pub fn load(config_path: impl AsRef<Path>) -> Result<Self> {
    let content = fs::read_to_string(config_path)?;
    Ok(toml::from_str(&content)?)
  }

  /// Loads the config, or writes and returns the default one when it is missing or broken.
  pub fn load_or_create(config_path: impl AsRef<Path>) -> Self {
    let config_path = config_path.as_ref();
    if config_path.exists() {
      match Self::load(config_path) {
        Ok(config) => {
          info!("[Config] Loaded configuration from {}", config_path.display());
          return config;
        }
        Err(e) => warn!("[Config] Failed to load {}: {e}", config_path.display()),
      }
    }

    let config = Config::default();
    match config.save(config_path) {
      Ok(()) => info!("[Config] Created default configuration at {}", config_path.display()),
      Err(e) => warn!("[Config] Failed to save default config: {e}"),
    }
    config
  }

  pub fn save(&self, config_path: impl AsRef<Path>) -> Result<()> {
    let toml_string = toml::to_string_pretty(self)?;
    fs::write(config_path, toml_string)?;
    Ok(())
  }
}
