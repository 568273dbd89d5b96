mod common;

use common::{dec, setup, stored};
use redagg::storage::table_row::RowReadLike;
use redagg::*;

fn car_catalog(storage: &Storage, maintainer: &AggregateMaintainer, name: &str) -> Id {
    let mut session = Session::begin(storage, maintainer).unwrap();
    let catalog = session.add("CarCatalog", row([("name", name)])).unwrap();
    session.flush().unwrap();
    let id = session.id(catalog).unwrap().unwrap();
    session.commit().unwrap();
    id
}

#[test]
fn empty_collection_gets_defaults() {
    let (storage, maintainer) = setup("empty_defaults");
    let id = car_catalog(&storage, &maintainer, "empty");
    assert_eq!(stored(&storage, "CarCatalog", id, "net_worth"), dec("0"));
    assert_eq!(stored(&storage, "CarCatalog", id, "product_count"), Value::Int(0));
    assert_eq!(stored(&storage, "CarCatalog", id, "cheapest"), Value::Null);
}

#[test]
fn reparenting_updates_both_parents() {
    let (storage, maintainer) = setup("reparenting");
    let c1 = car_catalog(&storage, &maintainer, "C1");
    let c2 = car_catalog(&storage, &maintainer, "C2");

    let mut session = Session::begin(&storage, &maintainer).unwrap();
    session.add("Product", row([("price", dec("30")), ("catalog_id", Value::Id(c1))])).unwrap();
    session.add("Product", row([("price", dec("5")), ("catalog_id", Value::Id(c1))])).unwrap();
    session.commit().unwrap();
    assert_eq!(stored(&storage, "CarCatalog", c1, "net_worth"), dec("35"));

    let mut session = Session::begin(&storage, &maintainer).unwrap();
    let product_id = storage.all("Product").unwrap().into_iter().find(|p| p.get("price") == Some(&dec("30"))).unwrap().id;
    let moved = session.get("Product", product_id).unwrap().unwrap();
    session.set(moved, "catalog_id", Value::Id(c2)).unwrap();
    session.commit().unwrap();

    assert_eq!(stored(&storage, "CarCatalog", c1, "net_worth"), dec("5"));
    assert_eq!(stored(&storage, "CarCatalog", c1, "product_count"), Value::Int(1));
    assert_eq!(stored(&storage, "CarCatalog", c2, "net_worth"), dec("30"));
    assert_eq!(stored(&storage, "CarCatalog", c2, "cheapest"), dec("30"));
}

#[test]
fn deleting_last_child_restores_default() {
    let (storage, maintainer) = setup("delete_default");
    let c1 = car_catalog(&storage, &maintainer, "C1");
    let mut session = Session::begin(&storage, &maintainer).unwrap();
    session.add("Product", row([("price", dec("7")), ("catalog_id", Value::Id(c1))])).unwrap();
    session.commit().unwrap();

    let product_id = storage.all("Product").unwrap()[0].id;
    let mut session = Session::begin(&storage, &maintainer).unwrap();
    let product = session.get("Product", product_id).unwrap().unwrap();
    session.delete(product).unwrap();
    session.commit().unwrap();

    assert_eq!(stored(&storage, "CarCatalog", c1, "net_worth"), dec("0"));
    assert_eq!(stored(&storage, "CarCatalog", c1, "product_count"), Value::Int(0));
    assert_eq!(stored(&storage, "CarCatalog", c1, "cheapest"), Value::Null);
}

#[test]
fn null_prices_are_ignored() {
    let (storage, maintainer) = setup("null_prices");
    let c1 = car_catalog(&storage, &maintainer, "C1");
    let mut session = Session::begin(&storage, &maintainer).unwrap();
    session.add("Product", row([("catalog_id", Value::Id(c1))])).unwrap();
    session.add("Product", row([("price", dec("0.1")), ("catalog_id", Value::Id(c1))])).unwrap();
    session.add("Product", row([("price", dec("0.2")), ("catalog_id", Value::Id(c1))])).unwrap();
    session.commit().unwrap();

    assert_eq!(stored(&storage, "CarCatalog", c1, "net_worth"), dec("0.3"));
    assert_eq!(stored(&storage, "CarCatalog", c1, "product_count"), Value::Int(3));
    assert_eq!(stored(&storage, "CarCatalog", c1, "cheapest"), dec("0.1"));
}

#[test]
fn rollback_discards_child_and_aggregate() {
    let (storage, maintainer) = setup("rollback");
    let c1 = car_catalog(&storage, &maintainer, "C1");
    let mut session = Session::begin(&storage, &maintainer).unwrap();
    let catalog = session.get("CarCatalog", c1).unwrap().unwrap();
    session.add("Product", row([("price", dec("99")), ("catalog_id", Value::Id(c1))])).unwrap();
    session.flush().unwrap();
    assert_eq!(session.value(catalog, "net_worth").unwrap(), dec("99"));
    session.rollback().unwrap();

    assert_eq!(stored(&storage, "CarCatalog", c1, "net_worth"), dec("0"));
    assert!(storage.all("Product").unwrap().is_empty());
}

#[test]
fn unknown_discriminator_fails_flush() {
    let (storage, maintainer) = setup("unknown_discriminator");
    let tx = storage.begin_write().unwrap();
    {
        let mut catalogs = storage.row_factory("catalog").unwrap().open(&tx).unwrap();
        catalogs.insert_row(1, &row([("name", Value::from("boats")), ("type", Value::from("boats"))])).unwrap();
    }
    tx.commit().unwrap();

    let mut session = Session::begin(&storage, &maintainer).unwrap();
    session.add("Product", row([("price", dec("1")), ("catalog_id", Value::Id(1))])).unwrap();
    assert!(matches!(session.flush(), Err(AppError::UnresolvedParent { id: 1, .. })));
    drop(session);
    assert!(storage.all("Product").unwrap().is_empty());
}

#[test]
fn missing_subtype_row_fails_flush() {
    let (storage, maintainer) = setup("missing_subtype");
    let c1 = car_catalog(&storage, &maintainer, "C1");
    let tx = storage.begin_write().unwrap();
    {
        let mut cars = storage.row_factory("car_catalog").unwrap().open(&tx).unwrap();
        assert!(cars.delete_row(c1).unwrap().is_some());
        assert!(cars.get_row(c1).unwrap().is_none());
    }
    tx.commit().unwrap();

    let mut session = Session::begin(&storage, &maintainer).unwrap();
    session.add("Product", row([("price", dec("1")), ("catalog_id", Value::Id(c1))])).unwrap();
    let result = session.commit();
    assert!(matches!(result, Err(AppError::UnresolvedParent { .. })));
    assert!(storage.all("Product").unwrap().is_empty());
}

#[test]
fn costume_catalog_cannot_own_products() {
    let (storage, maintainer) = setup("costume_parent");
    let mut session = Session::begin(&storage, &maintainer).unwrap();
    let costumes = session.add("CostumeCatalog", row([("name", "hats")])).unwrap();
    session.add("Product", row([("price", dec("1")), ("catalog_id", Value::Ref(costumes))])).unwrap();
    assert!(matches!(session.commit(), Err(AppError::UnresolvedParent { .. })));
    assert!(storage.all("Catalog").unwrap().is_empty());
}

#[test]
fn bulk_writes_need_manual_recompute() {
    let (storage, maintainer) = setup("bulk");
    let c1 = car_catalog(&storage, &maintainer, "C1");
    let c2 = car_catalog(&storage, &maintainer, "C2");

    let tx = storage.begin_write().unwrap();
    {
        let writer = EntityWriter::new(&storage, &tx);
        for (i, catalog) in [c1, c1, c2].into_iter().enumerate() {
            let id = writer.next_id("Product").unwrap();
            writer.insert("Product", id, &row([("price", dec(&format!("{}", i + 1))), ("catalog_id", Value::Id(catalog))])).unwrap();
        }
    }
    tx.commit().unwrap();
    assert_eq!(stored(&storage, "CarCatalog", c1, "net_worth"), dec("0"));

    let mut session = Session::begin(&storage, &maintainer).unwrap();
    assert_eq!(session.verify("Catalog", c1).unwrap().len(), 3);
    let report = session.recompute_all("Catalog").unwrap();
    assert_eq!(report.written.len(), 6);
    assert!(session.verify("Catalog", c1).unwrap().is_empty());
    let again = session.recompute_all("Catalog").unwrap();
    assert!(again.written.is_empty());
    assert_eq!(again.unchanged, 6);
    session.commit().unwrap();

    assert_eq!(stored(&storage, "CarCatalog", c1, "net_worth"), dec("3"));
    assert_eq!(stored(&storage, "CarCatalog", c2, "net_worth"), dec("3"));
    assert_eq!(stored(&storage, "CarCatalog", c2, "product_count"), Value::Int(1));
}

#[test]
fn ambiguous_registration_is_rejected() {
    let model = Arc::new(common::catalog_model());
    let mut registry = AggregateRegistry::new(model);
    let spec = || AggregateSpec::builder("CarCatalog")
        .relationship("products")
        .aggregate(Aggregation::sum("price"))
        .column("net_worth")
        .build()
        .unwrap();
    registry.register(spec()).unwrap();
    assert!(matches!(registry.register(spec()), Err(AppError::AmbiguousAggregate { .. })));
}

#[test]
fn aggregate_columns_cannot_be_assigned() {
    let (storage, maintainer) = setup("assign_aggregate");
    let c1 = car_catalog(&storage, &maintainer, "C1");
    let mut session = Session::begin(&storage, &maintainer).unwrap();
    session.add("Product", row([("price", dec("5")), ("catalog_id", Value::Id(c1))])).unwrap();
    session.commit().unwrap();

    let mut session = Session::begin(&storage, &maintainer).unwrap();
    let catalog = session.get("Catalog", c1).unwrap().unwrap();
    assert!(matches!(session.set(catalog, "net_worth", dec("999")), Err(AppError::Custom(_))));
    assert!(matches!(session.set(catalog, "product_count", Value::Int(7)), Err(AppError::Custom(_))));
    assert!(matches!(
        session.add("CarCatalog", row([("name", Value::from("C2")), ("net_worth", dec("1"))])),
        Err(AppError::Custom(_))
    ));
    session.set(catalog, "model", "sedan").unwrap();
    session.commit().unwrap();

    assert_eq!(stored(&storage, "CarCatalog", c1, "net_worth"), dec("5"));
    assert_eq!(stored(&storage, "CarCatalog", c1, "product_count"), Value::Int(1));
    assert_eq!(stored(&storage, "CarCatalog", c1, "model"), Value::from("sedan"));
}
