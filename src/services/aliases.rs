//! Node alias translation: full storage node ids <-> compact integers.
//!
//! Aliases are persisted once per node in `node_aliases` and cached in
//! memory in both directions. The cache only ever grows.

use crate::{
    errors::{MetabaseError, MetabaseResult, StorageContext},
    models::{AliasPiece, AliasPieces, NodeAlias, NodeId, Piece, Pieces},
};
use sqlx::{QueryBuilder, SqliteConnection, SqlitePool, sqlite::Sqlite};
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

#[derive(Default)]
struct AliasMaps {
    by_node: HashMap<NodeId, NodeAlias>,
    by_alias: HashMap<NodeAlias, NodeId>,
}

/// Bidirectional node alias lookup backed by the `node_aliases` table.
pub struct NodeAliasCache {
    db: Arc<SqlitePool>,
    maps: RwLock<AliasMaps>,
}

impl NodeAliasCache {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self {
            db,
            maps: RwLock::new(AliasMaps::default()),
        }
    }

    fn cached_alias(&self, node: &NodeId) -> Option<NodeAlias> {
        let maps = self.maps.read().unwrap_or_else(PoisonError::into_inner);
        maps.by_node.get(node).copied()
    }

    fn cached_node(&self, alias: NodeAlias) -> Option<NodeId> {
        let maps = self.maps.read().unwrap_or_else(PoisonError::into_inner);
        maps.by_alias.get(&alias).copied()
    }

    fn remember(&self, entries: impl IntoIterator<Item = (NodeId, NodeAlias)>) {
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        for (node, alias) in entries {
            maps.by_node.insert(node, alias);
            maps.by_alias.insert(alias, node);
        }
    }

    /// Make sure every node has an alias, assigning new ones as needed.
    ///
    /// Runs outside of any caller transaction: an alias that outlives an
    /// aborted write is harmless.
    pub async fn ensure_nodes(&self, nodes: &[NodeId]) -> MetabaseResult<()> {
        let missing: Vec<NodeId> = nodes
            .iter()
            .filter(|node| self.cached_alias(node).is_none())
            .copied()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        if let Some(node) = missing.iter().find(|node| node.is_zero()) {
            return Err(MetabaseError::invalid(format!(
                "tried to alias zero node id {}",
                node
            )));
        }

        let mut insert = QueryBuilder::<Sqlite>::new("INSERT INTO node_aliases (node_id) ");
        insert.push_values(&missing, |mut row, node| {
            row.push_bind(*node);
        });
        insert.push(" ON CONFLICT (node_id) DO NOTHING");
        insert
            .build()
            .execute(&*self.db)
            .await
            .op("ensure node aliases")?;

        self.load_nodes(&missing).await
    }

    async fn load_nodes(&self, nodes: &[NodeId]) -> MetabaseResult<()> {
        let mut select =
            QueryBuilder::<Sqlite>::new("SELECT node_id, node_alias FROM node_aliases WHERE node_id IN (");
        let mut separated = select.separated(", ");
        for node in nodes {
            separated.push_bind(*node);
        }
        separated.push_unseparated(")");

        let rows: Vec<(NodeId, i64)> = select
            .build_query_as()
            .fetch_all(&*self.db)
            .await
            .op("load node aliases")?;
        self.remember(rows.into_iter().map(|(node, alias)| (node, NodeAlias(alias))));
        Ok(())
    }

    /// Reload the whole table. Used when an alias is not cached yet, e.g.
    /// assigned by another process sharing the database. Reads through the
    /// caller's connection so it works inside an open read transaction.
    async fn refresh(&self, conn: &mut SqliteConnection) -> MetabaseResult<()> {
        let rows: Vec<(NodeId, i64)> =
            sqlx::query_as("SELECT node_id, node_alias FROM node_aliases")
                .fetch_all(&mut *conn)
                .await
                .op("refresh node aliases")?;
        tracing::debug!(count = rows.len(), "refreshed node alias cache");
        self.remember(rows.into_iter().map(|(node, alias)| (node, NodeAlias(alias))));
        Ok(())
    }

    /// Translate pieces for storage, assigning aliases to unknown nodes.
    pub async fn convert_pieces_to_aliases(&self, pieces: &Pieces) -> MetabaseResult<AliasPieces> {
        let nodes: Vec<NodeId> = pieces.iter().map(|piece| piece.storage_node).collect();
        self.ensure_nodes(&nodes).await?;

        let mut aliases = Vec::with_capacity(pieces.len());
        for piece in pieces.iter() {
            let alias = self.cached_alias(&piece.storage_node).ok_or_else(|| {
                MetabaseError::Corrupted(format!(
                    "alias for node {} missing after insert",
                    piece.storage_node
                ))
            })?;
            aliases.push(AliasPiece {
                number: piece.number,
                alias,
            });
        }
        Ok(AliasPieces(aliases))
    }

    /// Translate stored alias pieces back to storage nodes.
    pub async fn convert_aliases_to_pieces(
        &self,
        conn: &mut SqliteConnection,
        aliases: &AliasPieces,
    ) -> MetabaseResult<Pieces> {
        if aliases
            .0
            .iter()
            .any(|piece| self.cached_node(piece.alias).is_none())
        {
            self.refresh(conn).await?;
        }

        let mut pieces = Vec::with_capacity(aliases.0.len());
        for piece in &aliases.0 {
            let storage_node = self.cached_node(piece.alias).ok_or_else(|| {
                MetabaseError::Corrupted(format!("unknown node alias {}", piece.alias.0))
            })?;
            pieces.push(Piece {
                number: piece.number,
                storage_node,
            });
        }
        Ok(Pieces(pieces))
    }

    /// Number of aliases currently cached.
    pub fn cached_len(&self) -> usize {
        self.maps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_node
            .len()
    }
}
