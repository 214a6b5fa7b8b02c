//! 远程目录树 - 每次扫描生成一份不可变快照

use crate::error::{MigrateError, Result};
use crate::remote::{NodeKind, RemoteEntry, RemoteId};
use std::collections::{HashMap, HashSet};

/// 目录树节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub id: RemoteId,
    /// 清理后的名称（可直接作为本地路径组件）
    pub name: String,
    pub kind: NodeKind,
    pub size: u64,
    pub parent_id: Option<RemoteId>,
    /// 相对路径，使用 `/` 分隔，根节点为空串
    pub path: String,
}

impl TreeNode {
    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }
}

/// 一次完整扫描得到的目录树
#[derive(Debug, Clone)]
pub struct Tree {
    root_id: RemoteId,
    nodes: HashMap<RemoteId, TreeNode>,
    /// 子节点按名称排序
    children: HashMap<RemoteId, Vec<RemoteId>>,
}

impl Tree {
    /// 从列表结果构建目录树
    ///
    /// 每个非根节点的父节点都必须在同一批结果中（或者就是根节点），
    /// 否则返回 `InvalidTree`。同一目录下重名的节点会被改名以保证路径唯一。
    pub fn from_entries(root_id: RemoteId, entries: Vec<RemoteEntry>) -> Result<Self> {
        let mut raw: HashMap<RemoteId, RemoteEntry> = HashMap::with_capacity(entries.len());
        for entry in entries {
            if entry.id == root_id {
                continue;
            }
            let id = entry.id;
            if raw.insert(id, entry).is_some() {
                return Err(MigrateError::InvalidTree(format!("重复的节点 ID: {}", id)));
            }
        }

        let mut grouped: HashMap<RemoteId, Vec<&RemoteEntry>> = HashMap::new();
        for entry in raw.values() {
            let parent = entry.parent_id.ok_or_else(|| {
                MigrateError::InvalidTree(format!("节点 {} 缺少父节点", entry.id))
            })?;
            let parent_is_folder = parent == root_id
                || raw
                    .get(&parent)
                    .map(|p| p.kind == NodeKind::Folder)
                    .unwrap_or(false);
            if !parent_is_folder {
                return Err(MigrateError::InvalidTree(format!(
                    "节点 {} 的父节点 {} 不存在或不是目录",
                    entry.id, parent
                )));
            }
            grouped.entry(parent).or_default().push(entry);
        }

        let mut nodes = HashMap::with_capacity(raw.len() + 1);
        let mut children: HashMap<RemoteId, Vec<RemoteId>> = HashMap::new();
        nodes.insert(
            root_id,
            TreeNode {
                id: root_id,
                name: String::new(),
                kind: NodeKind::Folder,
                size: 0,
                parent_id: None,
                path: String::new(),
            },
        );

        // 从根开始深度优先计算路径，父节点一定先于子节点
        let mut stack = vec![root_id];
        while let Some(folder_id) = stack.pop() {
            let Some(siblings) = grouped.remove(&folder_id) else {
                continue;
            };
            let mut siblings: Vec<(String, &RemoteEntry)> = siblings
                .into_iter()
                .map(|entry| (sanitize_component(&entry.name), entry))
                .collect();
            // 不区分大小写排序，同名时 ID 小的保留原名
            siblings.sort_by(|a, b| {
                a.0.to_lowercase()
                    .cmp(&b.0.to_lowercase())
                    .then(a.1.id.cmp(&b.1.id))
            });

            let parent_path = nodes
                .get(&folder_id)
                .map(|n: &TreeNode| n.path.clone())
                .unwrap_or_default();

            // 先为所有原名占位，改名后的名字不能抢占真实存在的兄弟节点
            let mut used = HashSet::new();
            let keeps: Vec<bool> = siblings
                .iter()
                .map(|(name, _)| used.insert(name.to_lowercase()))
                .collect();
            let mut ids = Vec::with_capacity(siblings.len());

            for ((name, entry), keep) in siblings.into_iter().zip(keeps) {
                let name = if keep {
                    name
                } else {
                    let mut attempt = 0;
                    loop {
                        let candidate = disambiguate(&name, entry.id, attempt);
                        if used.insert(candidate.to_lowercase()) {
                            break candidate;
                        }
                        attempt += 1;
                    }
                };
                let path = if parent_path.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", parent_path, name)
                };

                if entry.kind == NodeKind::Folder {
                    stack.push(entry.id);
                }
                ids.push(entry.id);
                nodes.insert(
                    entry.id,
                    TreeNode {
                        id: entry.id,
                        name,
                        kind: entry.kind,
                        size: if entry.kind == NodeKind::File { entry.size } else { 0 },
                        parent_id: Some(folder_id),
                        path,
                    },
                );
            }
            children.insert(folder_id, ids);
        }

        // 剩下没被访问到的节点说明父子关系存在环
        if nodes.len() != raw.len() + 1 {
            return Err(MigrateError::InvalidTree(format!(
                "{} 个节点无法从根目录到达",
                raw.len() + 1 - nodes.len()
            )));
        }

        Ok(Self {
            root_id,
            nodes,
            children,
        })
    }

    pub fn root_id(&self) -> RemoteId {
        self.root_id
    }

    pub fn get(&self, id: RemoteId) -> Option<&TreeNode> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: RemoteId) -> bool {
        id != self.root_id && self.nodes.contains_key(&id)
    }

    /// 节点数（不含根）
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn file_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_file()).count()
    }

    pub fn total_file_bytes(&self) -> u64 {
        self.nodes
            .values()
            .filter(|n| n.is_file())
            .map(|n| n.size)
            .sum()
    }

    /// 深度优先、父先于子的文件序列
    pub fn flatten(&self) -> Vec<&TreeNode> {
        self.walk().into_iter().filter(|n| n.is_file()).collect()
    }

    /// 与 `flatten` 同序的目录序列
    pub fn folders(&self) -> Vec<&TreeNode> {
        self.walk().into_iter().filter(|n| n.is_folder()).collect()
    }

    fn walk(&self) -> Vec<&TreeNode> {
        let mut out = Vec::with_capacity(self.len());
        let mut stack: Vec<RemoteId> = self.child_ids(self.root_id).iter().rev().copied().collect();

        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            out.push(node);
            if node.is_folder() {
                stack.extend(self.child_ids(id).iter().rev().copied());
            }
        }
        out
    }

    fn child_ids(&self, id: RemoteId) -> &[RemoteId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// 清理路径组件，防止路径穿越
fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" => "_".to_string(),
        "." | ".." => format!("_{}", cleaned),
        _ => cleaned,
    }
}

/// 重名时把 ID 插入到扩展名之前：`a.mkv` -> `a (42).mkv`，
/// 仍然冲突时追加序号：`a (42-1).mkv`
fn disambiguate(name: &str, id: RemoteId, attempt: u32) -> String {
    let tag = if attempt == 0 {
        id.to_string()
    } else {
        format!("{}-{}", id, attempt)
    };
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{} ({}).{}", stem, tag, ext),
        _ => format!("{} ({})", name, tag),
    }
}
