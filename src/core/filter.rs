//! 文件过滤规则
//!
//! 不同类别之间是“与”关系，同一类别内的列表是“或”关系。
//! 目录总是匹配，保证目录结构完整。

use crate::core::tree::TreeNode;
use crate::error::ConfigError;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// 过滤规则
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRules {
    /// 仅包含的扩展名（空表示不限制），不区分大小写，可带或不带前导点
    pub allowed_extensions: Vec<String>,
    /// 排除的扩展名
    pub blocked_extensions: Vec<String>,
    /// 最小文件大小（字节）
    pub min_size: Option<u64>,
    /// 最大文件大小（字节）
    pub max_size: Option<u64>,
    /// 包含规则（glob），空表示全部包含
    pub include_patterns: Vec<String>,
    /// 排除规则（glob）
    pub exclude_patterns: Vec<String>,
}

impl FilterRules {
    pub fn is_empty(&self) -> bool {
        *self == FilterRules::default()
    }
}

/// 编译后的 glob 规则
#[derive(Debug, Clone)]
struct GlobPattern {
    regex: Regex,
    /// 不含 `/` 的规则只匹配文件名
    name_only: bool,
}

impl GlobPattern {
    fn new(pattern: &str) -> Result<Self, ConfigError> {
        let pattern = pattern.trim().trim_start_matches('/');
        let regex = Regex::new(&glob_to_regex(pattern))
            .map_err(|e| ConfigError::InvalidFilter(format!("{}: {}", pattern, e)))?;
        Ok(Self {
            regex,
            name_only: !pattern.contains('/'),
        })
    }

    fn is_match(&self, node: &TreeNode) -> bool {
        if self.name_only {
            self.regex.is_match(&node.name)
        } else {
            self.regex.is_match(&node.path)
        }
    }
}

/// 预编译的过滤器，扫描大量节点时避免重复编译正则
#[derive(Debug, Clone)]
pub struct FilterEngine {
    allowed_suffixes: Vec<String>,
    blocked_suffixes: Vec<String>,
    min_size: Option<u64>,
    max_size: Option<u64>,
    include: Vec<GlobPattern>,
    exclude: Vec<GlobPattern>,
}

impl FilterEngine {
    pub fn new(rules: &FilterRules) -> Result<Self, ConfigError> {
        if let (Some(min), Some(max)) = (rules.min_size, rules.max_size) {
            if min > max {
                return Err(ConfigError::InvalidFilter(format!(
                    "min_size ({}) 大于 max_size ({})",
                    min, max
                )));
            }
        }

        Ok(Self {
            allowed_suffixes: normalize_extensions(&rules.allowed_extensions),
            blocked_suffixes: normalize_extensions(&rules.blocked_extensions),
            min_size: rules.min_size,
            max_size: rules.max_size,
            include: rules
                .include_patterns
                .iter()
                .map(|p| GlobPattern::new(p))
                .collect::<Result<_, _>>()?,
            exclude: rules
                .exclude_patterns
                .iter()
                .map(|p| GlobPattern::new(p))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn matches(&self, node: &TreeNode) -> bool {
        if node.is_folder() {
            return true;
        }

        let name = node.name.to_lowercase();
        if !self.allowed_suffixes.is_empty()
            && !self.allowed_suffixes.iter().any(|s| name.ends_with(s.as_str()))
        {
            return false;
        }
        if self.blocked_suffixes.iter().any(|s| name.ends_with(s.as_str())) {
            return false;
        }

        if self.min_size.is_some_and(|min| node.size < min) {
            return false;
        }
        if self.max_size.is_some_and(|max| node.size > max) {
            return false;
        }

        if !self.include.is_empty() && !self.include.iter().any(|p| p.is_match(node)) {
            return false;
        }
        !self.exclude.iter().any(|p| p.is_match(node))
    }
}

/// 判断节点是否满足过滤规则
///
/// 规则无效（无法编译）时不匹配任何文件；配置加载阶段已经校验过规则。
pub fn matches(node: &TreeNode, rules: &FilterRules) -> bool {
    FilterEngine::new(rules)
        .map(|engine| engine.matches(node))
        .unwrap_or(false)
}

/// 扩展名统一为小写的 `.ext` 后缀
fn normalize_extensions(exts: &[String]) -> Vec<String> {
    exts.iter()
        .map(|e| e.trim().trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .map(|e| format!(".{}", e))
        .collect()
}

/// glob 转正则：`**` 匹配任意字符（含 `/`），`*` 不跨目录，`?` 匹配单个字符
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("(?i)^");
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    // `**/` 可以匹配零层目录
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => {
                let mut buf = [0u8; 4];
                out.push_str(&regex::escape(other.encode_utf8(&mut buf)));
            }
        }
    }

    out.push('$');
    out
}
