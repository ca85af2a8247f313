//! Stock catalogue items.

use common::Sku;
use serde::{Deserialize, Serialize};

use crate::{DomainError, Money};

/// What buying an item does beyond decrementing stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ItemKind {
    /// Ordinary goods.
    #[default]
    Goods,
    /// A profile status; committing the purchase sets the buyer's status to
    /// the item name.
    Status,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Goods => "goods",
            ItemKind::Status => "status",
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "goods" => Ok(ItemKind::Goods),
            "status" => Ok(ItemKind::Status),
            other => Err(DomainError::UnknownItemKind(other.to_string())),
        }
    }
}

/// A stock row owned by the stock service. `count` never goes negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockItem {
    pub sku: Sku,
    pub name: String,
    pub price: Money,
    pub count: i64,
    pub kind: ItemKind,
}

impl StockItem {
    pub fn new(sku: Sku, name: impl Into<String>, price: Money, count: i64) -> Self {
        Self {
            sku,
            name: name.into(),
            price,
            count,
            kind: ItemKind::Goods,
        }
    }

    /// Marks this item as a purchasable profile status.
    pub fn as_status(mut self) -> Self {
        self.kind = ItemKind::Status;
        self
    }

    /// The immutable part of the item that travels with the saga.
    pub fn snapshot(&self) -> ItemSnapshot {
        ItemSnapshot {
            sku: self.sku,
            name: self.name.clone(),
            price: self.price,
            kind: self.kind,
        }
    }
}

/// Item attributes copied into saga messages so that later steps never
/// have to read the stock service's state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub sku: Sku,
    pub name: String,
    pub price: Money,
    pub kind: ItemKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_copies_attributes() {
        let item = StockItem::new(Sku::new(4), "gold", Money::from_cents(50), 3).as_status();
        let snap = item.snapshot();
        assert_eq!(snap.sku, Sku::new(4));
        assert_eq!(snap.name, "gold");
        assert_eq!(snap.price, Money::from_cents(50));
        assert_eq!(snap.kind, ItemKind::Status);
    }

    #[test]
    fn test_item_kind_parse() {
        assert_eq!("goods".parse::<ItemKind>().unwrap(), ItemKind::Goods);
        assert_eq!("status".parse::<ItemKind>().unwrap(), ItemKind::Status);
        assert!("service".parse::<ItemKind>().is_err());
    }
}
