//! Wire dialects and built-in vendor presets.
//!
//! A binding's `provider` either names a dialect directly (`openai`, `claude`,
//! `qwen`) or one of the presets below. Presets fill in the dialect and the
//! default base URL so a config only needs the vendor name and a key.

use serde::Serialize;

/// The wire dialect an adapter speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Flat `/chat/completions` and `/completions` with bearer auth.
    OpenAi,
    /// `/messages` with `x-api-key` and a versioned header.
    Claude,
    /// DashScope generation endpoint with nested `input` / `parameters`.
    Qwen,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Claude => "claude",
            ProviderKind::Qwen => "qwen",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct VendorPreset {
    pub name: &'static str,
    pub base_url: &'static str,
    pub dialect: ProviderKind,
}

const PRESETS: &[VendorPreset] = &[
    VendorPreset {
        name: "openai",
        base_url: "https://api.openai.com/v1",
        dialect: ProviderKind::OpenAi,
    },
    VendorPreset {
        name: "claude",
        base_url: "https://api.anthropic.com/v1",
        dialect: ProviderKind::Claude,
    },
    VendorPreset {
        name: "anthropic",
        base_url: "https://api.anthropic.com/v1",
        dialect: ProviderKind::Claude,
    },
    VendorPreset {
        name: "qwen",
        base_url: "https://dashscope.aliyuncs.com/api/v1",
        dialect: ProviderKind::Qwen,
    },
    VendorPreset {
        name: "dashscope",
        base_url: "https://dashscope.aliyuncs.com/api/v1",
        dialect: ProviderKind::Qwen,
    },
    VendorPreset {
        name: "zhipu",
        base_url: "https://open.bigmodel.cn/api/paas/v4",
        dialect: ProviderKind::OpenAi,
    },
    VendorPreset {
        name: "xunfei",
        base_url: "https://spark-api-open.xf-yun.com/v1",
        dialect: ProviderKind::OpenAi,
    },
    VendorPreset {
        name: "baidu",
        base_url: "https://qianfan.baidubce.com/v2",
        dialect: ProviderKind::OpenAi,
    },
    VendorPreset {
        name: "deepseek",
        base_url: "https://api.deepseek.com/v1",
        dialect: ProviderKind::OpenAi,
    },
    VendorPreset {
        name: "moonshot",
        base_url: "https://api.moonshot.cn/v1",
        dialect: ProviderKind::OpenAi,
    },
    VendorPreset {
        name: "openrouter",
        base_url: "https://openrouter.ai/api/v1",
        dialect: ProviderKind::OpenAi,
    },
];

/// Presets that share another preset's normalizer rules.
const RULE_ALIASES: &[(&str, &str)] = &[("anthropic", "claude"), ("dashscope", "qwen")];

/// Lowercased rule key for a vendor name, with preset aliases folded onto
/// their primary name.
pub fn rule_key(name: &str) -> String {
    let name = name.trim().to_lowercase();
    RULE_ALIASES
        .iter()
        .find(|(alias, _)| name == *alias)
        .map_or(name, |(_, primary)| (*primary).to_string())
}

impl VendorPreset {
    #[must_use]
    pub fn from_name(name: &str) -> Option<&'static VendorPreset> {
        let name = name.trim().to_lowercase();
        PRESETS.iter().find(|p| p.name == name)
    }

    #[must_use]
    pub fn all() -> &'static [VendorPreset] {
        PRESETS
    }

    /// Comma-separated preset names, for error messages.
    pub fn known_names() -> String {
        PRESETS.iter().map(|p| p.name).collect::<Vec<_>>().join(", ")
    }
}
