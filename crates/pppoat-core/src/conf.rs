//! 键值配置存储。
//!
//! 配置来源依次为命令行 `key=value` 对与可选的配置文件，后读入的来源覆盖先读入的同名键。
//! 键名约定为 `模块名.选项`（如 `udp.port`），由各驱动在初始化时按名查询。

use std::{collections::BTreeMap, fs, path::Path, str::FromStr};

use parking_lot::RwLock;

/// 配置读取与解析阶段的错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfError {
    /// 命令行参数不是 `key=value` 形式，或键为空。
    #[error("无法解析配置项 `{0}`，期望 key=value")]
    MalformedPair(String),
    /// 配置文件无法读取。
    #[error("无法读取配置文件 {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 配置文件某一行格式错误。
    #[error("配置文件 {path} 第 {line} 行格式错误")]
    MalformedLine { path: String, line: usize },
    /// 键存在但取值无法转换为目标类型。
    #[error("配置项 {key} 的取值 `{value}` 无法解析")]
    InvalidValue { key: String, value: String },
}

/// 进程级配置存储，内部以读写锁保护有序映射，可在多个模块间共享读取。
#[derive(Debug, Default)]
pub struct Conf {
    entries: RwLock<BTreeMap<String, String>>,
}

impl Conf {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入或覆盖一个键。
    pub fn store(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.write().insert(key.into(), value.into());
    }

    /// 仅当键不存在时写入，返回是否写入。
    pub fn store_default(&self, key: &str, value: &str) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(key.to_owned(), value.to_owned());
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn find_string(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    /// 读取布尔开关：键存在且取值为空、`1`、`true`、`yes`、`on`（不区分大小写）时为真。
    pub fn find_bool(&self, key: &str) -> bool {
        self.entries.read().get(key).is_some_and(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "" | "1" | "true" | "yes" | "on"
            )
        })
    }

    /// 读取并解析为 `T`；键不存在返回 `Ok(None)`。
    pub fn find_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfError> {
        let Some(value) = self.find_string(key) else {
            return Ok(None);
        };
        value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfError::InvalidValue {
                key: key.to_owned(),
                value,
            })
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// 按字典序返回全部键。
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// 读入一组 `key=value` 形式的参数。
    ///
    /// 任一参数格式错误时整体失败，但此前已读入的参数保留。
    pub fn read_pairs<I, S>(&self, pairs: I) -> Result<(), ConfError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, value) =
                split_pair(pair).ok_or_else(|| ConfError::MalformedPair(pair.to_owned()))?;
            self.store(key, value);
        }
        Ok(())
    }

    /// 读入配置文件：每行一个 `key = value`，`#` 起始为注释，空行忽略。
    pub fn read_file(&self, path: impl AsRef<Path>) -> Result<(), ConfError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let content = fs::read_to_string(path).map_err(|source| ConfError::Read {
            path: display.clone(),
            source,
        })?;
        self.read_str(&display, &content)
    }

    /// 以配置文件格式解析一段文本，`origin` 仅用于错误信息。
    pub fn read_str(&self, origin: &str, content: &str) -> Result<(), ConfError> {
        let mut parsed = Vec::new();
        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = split_pair(line).ok_or_else(|| ConfError::MalformedLine {
                path: origin.to_owned(),
                line: index + 1,
            })?;
            parsed.push((key.to_owned(), value.to_owned()));
        }
        let mut entries = self.entries.write();
        entries.extend(parsed);
        Ok(())
    }

    /// 以 DEBUG 级别输出全部配置项。
    pub fn dump(&self) {
        let entries = self.entries.read();
        tracing::debug!(count = entries.len(), "configuration loaded");
        for (key, value) in entries.iter() {
            tracing::debug!(key = %key, value = %value, "conf");
        }
    }
}

fn split_pair(pair: &str) -> Option<(&str, &str)> {
    let (key, value) = pair.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim()))
}
