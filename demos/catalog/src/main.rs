use catalog as _;
use redagg::{info, row, AggregateMaintainer, AppConfig, AppError, Arc, Decimal, Model, Session, Storage, Value};
use std::str::FromStr;

fn price(s: &str) -> Result<Value, AppError> {
    Decimal::from_str(s).map(Value::Decimal).map_err(|e| AppError::Custom(e.to_string()))
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = AppConfig::new("config/settings")?;
    redagg::logger::set_debug(config.logging.debug);
    let model = Arc::new(Model::collect()?);
    let (created, storage) = Storage::init(config.storage.db_dir(), Arc::clone(&model), &config.storage).await?;
    let maintainer = AggregateMaintainer::collect(Arc::clone(&model), config.maintainer.clone())?;

    if created {
        let mut session = Session::begin(&storage, &maintainer)?;
        let some = session.add("CarCatalog", row([("name", "Some catalog"), ("model", "Model 1")]))?;
        let another = session.add("CarCatalog", row([("name", "Another catalog"), ("model", "Model 2")]))?;
        session.add("CostumeCatalog", row([("name", "Costumes")]))?;
        session.flush()?;
        let id_of = |handle| session.id(handle)?.ok_or_else(|| AppError::Custom("catalog was not flushed".to_string()));
        let (some_id, another_id) = (id_of(some)?, id_of(another)?);
        session.commit()?;

        let mut session = Session::begin(&storage, &maintainer)?;
        session.add("Product", row([("name", Value::from("Some product")), ("price", price("1000")?), ("catalog_id", Value::Id(some_id))]))?;
        session.commit()?;

        let mut session = Session::begin(&storage, &maintainer)?;
        session.add("Product", row([("name", Value::from("Another product")), ("price", price("2000")?), ("catalog_id", Value::Id(another_id))]))?;
        session.commit()?;
    } else {
        info!("Reusing existing catalog db, recomputing aggregates");
        let mut session = Session::begin(&storage, &maintainer)?;
        session.recompute_all("Catalog")?;
        session.commit()?;
    }

    let mut catalogs = storage.all("CarCatalog")?;
    catalogs.sort_by(|a, b| a.get("name").and_then(Value::as_text).cmp(&b.get("name").and_then(Value::as_text)));
    for catalog in catalogs {
        info!(
            "{} #{}: net_worth = {}, products = {}",
            catalog.get("name").cloned().unwrap_or(Value::Null),
            catalog.id,
            catalog.get("net_worth").cloned().unwrap_or(Value::Null),
            catalog.get("product_count").cloned().unwrap_or(Value::Null),
        );
    }
    Ok(())
}
