//! Catalog model: joined-table catalogs where only car catalogs own products and
//! carry their net worth as an aggregate column.

use redagg::{inventory, AggregateInfo, AggregateSpec, Aggregation, ColumnKind, Decimal, EntityDef, EntityInfo};

pub fn product() -> EntityDef {
    EntityDef::new("Product", "product")
        .column("name", ColumnKind::Text)
        .column("price", ColumnKind::Decimal)
        .column("catalog_id", ColumnKind::Id)
}

pub fn catalog() -> EntityDef {
    EntityDef::new("Catalog", "catalog")
        .column("name", ColumnKind::Text)
        .polymorphic_on("type")
}

pub fn costume_catalog() -> EntityDef {
    EntityDef::new("CostumeCatalog", "costume_catalog")
        .inherits("Catalog")
        .identity("costumes")
}

pub fn car_catalog() -> EntityDef {
    EntityDef::new("CarCatalog", "car_catalog")
        .inherits("Catalog")
        .identity("cars")
        .column_with_default("model", ColumnKind::Text, "")
        .column_with_default("net_worth", ColumnKind::Decimal, Decimal::ZERO)
        .column("product_count", ColumnKind::Int)
        .has_many("products", "Product", "catalog_id")
}

pub fn net_worth() -> AggregateSpec {
    AggregateSpec::builder("CarCatalog")
        .relationship("products")
        .aggregate(Aggregation::sum("price"))
        .column("net_worth")
        .build()
        .unwrap_or_else(|e| panic!("net_worth: {}", e))
}

pub fn product_count() -> AggregateSpec {
    AggregateSpec::builder("CarCatalog")
        .relationship("products")
        .aggregate(Aggregation::count())
        .column("product_count")
        .build()
        .unwrap_or_else(|e| panic!("product_count: {}", e))
}

inventory::submit! { EntityInfo { define: product } }
inventory::submit! { EntityInfo { define: catalog } }
inventory::submit! { EntityInfo { define: costume_catalog } }
inventory::submit! { EntityInfo { define: car_catalog } }
inventory::submit! { AggregateInfo { define: net_worth } }
inventory::submit! { AggregateInfo { define: product_count } }
