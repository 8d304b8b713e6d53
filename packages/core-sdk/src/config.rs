use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::models::ModelDescriptor;

/** \brief 通义兼容模式接口地址。 */
pub const DASHSCOPE_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

pub const DEFAULT_MODEL_ID: &str = "deepseek-r1";

static BUILTIN_MODELS: Lazy<Vec<ModelDescriptor>> = Lazy::new(|| {
    vec![
        ModelDescriptor {
            id: DEFAULT_MODEL_ID.to_string(),
            name: "Deepseek-R1".to_string(),
            base_url: DASHSCOPE_BASE_URL.to_string(),
            has_reasoning: true,
        },
        ModelDescriptor {
            id: "qwen-plus-2025-04-28".to_string(),
            name: "通义千问".to_string(),
            base_url: DASHSCOPE_BASE_URL.to_string(),
            has_reasoning: false,
        },
    ]
});

/**
 * \brief 服务配置：监听地址、数据库、上游密钥与模型表。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub addr: String,
    pub db_path: String,
    pub default_model: String,
    /** \brief 上游 API Key，通常来自 `DASHSCOPE_API_KEY`。 */
    pub api_key: String,
    /** \brief JWT 签名密钥；为空时所有请求均视为匿名。 */
    pub jwt_secret: Option<String>,
    pub models: Vec<ModelDescriptor>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3000".to_string(),
            db_path: "wms_relay.db".to_string(),
            default_model: DEFAULT_MODEL_ID.to_string(),
            api_key: String::new(),
            jwt_secret: None,
            models: BUILTIN_MODELS.clone(),
        }
    }
}

impl AppConfig {
    /**
     * \brief 读取配置：可选 JSON 文件（`WMS_RELAY_CONFIG`），再叠加环境变量。
     */
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("WMS_RELAY_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /**
     * \brief 从 JSON 文件读取；文件不存在时返回默认配置。
     */
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {} failed", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("parse config {} failed", path.display()))
    }

    /**
     * \brief 应用环境变量覆盖，`lookup` 便于测试注入。
     */
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("DASHSCOPE_API_KEY").filter(|v| !v.trim().is_empty()) {
            self.api_key = key;
        }
        if let Some(secret) = lookup("JWT_SECRET").filter(|v| !v.trim().is_empty()) {
            self.jwt_secret = Some(secret);
        }
        if let Some(path) = lookup("WMS_DB_PATH").filter(|v| !v.trim().is_empty()) {
            self.db_path = path;
        }
        if let Some(base) = lookup("WMS_UPSTREAM_BASE_URL").filter(|v| !v.trim().is_empty()) {
            for model in &mut self.models {
                model.base_url = base.clone();
            }
        }
    }

    pub fn find_model(&self, id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.id == id)
    }

    /**
     * \brief 解析模型；未知或缺省的 ID 回落到默认模型，从不失败。
     */
    pub fn resolve_model(&self, id: Option<&str>) -> &ModelDescriptor {
        id.and_then(|id| self.find_model(id))
            .or_else(|| self.find_model(&self.default_model))
            .or_else(|| self.models.first())
            .unwrap_or(&BUILTIN_MODELS[0])
    }
}
