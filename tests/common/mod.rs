#![allow(dead_code)]

use redagg::*;
use std::str::FromStr;

pub fn catalog_model() -> Model {
    Model::builder()
        .entity(EntityDef::new("Product", "product")
            .column("name", ColumnKind::Text)
            .column("price", ColumnKind::Decimal)
            .column("catalog_id", ColumnKind::Id))
        .entity(EntityDef::new("Catalog", "catalog")
            .column("name", ColumnKind::Text)
            .polymorphic_on("type"))
        .entity(EntityDef::new("CostumeCatalog", "costume_catalog")
            .inherits("Catalog")
            .identity("costumes"))
        .entity(EntityDef::new("CarCatalog", "car_catalog")
            .inherits("Catalog")
            .identity("cars")
            .column_with_default("model", ColumnKind::Text, "")
            .column_with_default("net_worth", ColumnKind::Decimal, Decimal::ZERO)
            .column("product_count", ColumnKind::Int)
            .column("cheapest", ColumnKind::Decimal)
            .has_many("products", "Product", "catalog_id"))
        .build()
        .expect("catalog model")
}

pub fn catalog_maintainer(model: Arc<Model>) -> AggregateMaintainer {
    let mut registry = AggregateRegistry::new(model);
    for (aggregation, column) in [
        (Aggregation::sum("price"), "net_worth"),
        (Aggregation::count(), "product_count"),
        (Aggregation::min("price"), "cheapest"),
    ] {
        registry.register(AggregateSpec::builder("CarCatalog")
            .relationship("products")
            .aggregate(aggregation)
            .column(column)
            .build()
            .expect("spec"))
            .expect("register");
    }
    AggregateMaintainer::new(registry, MaintainerSettings::default())
}

pub fn setup(name: &str) -> (Arc<Storage>, AggregateMaintainer) {
    let model = Arc::new(catalog_model());
    let storage = create_random_storage(name, Arc::clone(&model)).expect("storage");
    (storage, catalog_maintainer(model))
}

pub fn dec(s: &str) -> Value {
    Value::Decimal(Decimal::from_str(s).expect("decimal"))
}

pub fn stored(storage: &Storage, entity: &str, id: Id, column: &str) -> Value {
    storage.load(entity, id)
        .expect("load")
        .and_then(|e| e.get(column).cloned())
        .unwrap_or(Value::Null)
}
