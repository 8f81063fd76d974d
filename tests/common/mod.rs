use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::{Alias, ColumnDef, ColumnSpec, ColumnType, TableCreateStatement};
use sea_orm::{
    ActiveModelTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Schema, Set,
};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use storefront_api::{
    config::AppConfig,
    entities,
    events::{Event, EventSender},
    services::orders::Address,
    services::payment_gateway::SandboxGateway,
    AppState,
};

/// Test harness: application state over a single-connection in-memory SQLite
/// database with the schema created from the entities, plus a sandbox payment
/// gateway and a captured event stream.
pub struct TestApp {
    pub state: Arc<AppState>,
    pub db: Arc<DatabaseConnection>,
    pub gateway: Arc<SandboxGateway>,
    #[allow(dead_code)]
    pub config: Arc<AppConfig>,
    events: Mutex<mpsc::Receiver<Event>>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Construct a test application, letting the caller tweak the config
    /// (e.g. shrink the cart lock staleness window).
    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::for_testing("sqlite::memory:");
        adjust(&mut cfg);

        // A single pooled connection keeps every task on the same in-memory
        // database.
        let mut options = ConnectOptions::new(cfg.database_url.clone());
        options
            .max_connections(1)
            .min_connections(1)
            .sqlx_logging(false);
        let db = Database::connect(options)
            .await
            .expect("failed to create test database");

        create_schema(&db).await;

        let (tx, rx) = mpsc::channel(1024);
        let event_sender = Arc::new(EventSender::new(tx));

        let gateway = Arc::new(SandboxGateway::new(cfg.payment_signature_secret.clone()));
        let db = Arc::new(db);
        let config = Arc::new(cfg);

        let state = Arc::new(AppState::new(
            db.clone(),
            config.clone(),
            event_sender,
            gateway.clone(),
        ));

        Self {
            state,
            db,
            gateway,
            config,
            events: Mutex::new(rx),
        }
    }

    /// Drains and returns every event emitted so far.
    #[allow(dead_code)]
    pub async fn collect_events(&self) -> Vec<Event> {
        let mut rx = self.events.lock().await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Inserts an active product variant and returns its id.
    #[allow(dead_code)]
    pub async fn insert_variant(
        &self,
        price: Decimal,
        discount_percent: Decimal,
        stock: i32,
    ) -> Uuid {
        let variant_id = Uuid::new_v4();
        let variant = entities::product_variant::ActiveModel {
            id: Set(variant_id),
            product_id: Set(Uuid::new_v4()),
            sku: Set(format!("TEST-SKU-{variant_id}")),
            name: Set("Test variant".to_string()),
            size: Set(Some("M".to_string())),
            color: Set(Some("black".to_string())),
            price: Set(price),
            discount_percent: Set(discount_percent),
            stock: Set(stock),
            is_active: Set(true),
            low_stock_threshold: Set(1),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        };
        variant
            .insert(&*self.db)
            .await
            .expect("failed to insert test variant");
        variant_id
    }

    /// Current stock count for a variant.
    #[allow(dead_code)]
    pub async fn stock_of(&self, variant_id: Uuid) -> i32 {
        use sea_orm::EntityTrait;
        entities::ProductVariant::find_by_id(variant_id)
            .one(&*self.db)
            .await
            .expect("variant query failed")
            .expect("variant missing")
            .stock
    }
}

async fn create_schema(db: &DatabaseConnection) {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let statements = [
        schema.create_table_from_entity(entities::ProductVariant),
        schema.create_table_from_entity(entities::Cart),
        schema.create_table_from_entity(entities::CartItem),
        schema.create_table_from_entity(entities::Order),
        schema.create_table_from_entity(entities::OrderItem),
        schema.create_table_from_entity(entities::OrderStatusHistory),
        schema.create_table_from_entity(entities::Payment),
        schema.create_table_from_entity(entities::InventoryMovement),
    ];
    for statement in statements {
        let statement = sqlite_safe(statement);
        db.execute(backend.build(&statement))
            .await
            .expect("failed to create table");
    }
}

/// The entities model money as `Decimal(19, 4)`, which is the production
/// Postgres schema. The SQLite builder used by the in-memory test database
/// rejects any decimal precision above 16 (SQLite ignores the precision at
/// runtime regardless), so for schema generation we clamp the precision down
/// to 16 without touching scale or any other column attribute. This only
/// affects the DDL emitted for the test database; no entity definition or
/// stored value changes.
fn sqlite_safe(stmt: TableCreateStatement) -> TableCreateStatement {
    let needs_clamp = stmt.get_columns().iter().any(|col| {
        matches!(col.get_column_type(), Some(ColumnType::Decimal(Some((p, _)))) if *p > 16)
    });
    if !needs_clamp {
        return stmt;
    }

    let mut rebuilt = TableCreateStatement::new();
    if let Some(table) = stmt.get_table_name() {
        rebuilt.table(table.clone());
    }
    for col in stmt.get_columns() {
        let ty = match col.get_column_type() {
            Some(ColumnType::Decimal(Some((p, s)))) if *p > 16 => {
                ColumnType::Decimal(Some((16, *s)))
            }
            Some(other) => other.clone(),
            None => ColumnType::Text,
        };
        let mut def = ColumnDef::new_with_type(Alias::new(col.get_column_name()), ty);
        for spec in col.get_column_spec() {
            match spec {
                ColumnSpec::Null => def.null(),
                ColumnSpec::NotNull => def.not_null(),
                ColumnSpec::Default(expr) => def.default(expr.clone()),
                ColumnSpec::AutoIncrement => def.auto_increment(),
                ColumnSpec::UniqueKey => def.unique_key(),
                ColumnSpec::PrimaryKey => def.primary_key(),
                ColumnSpec::Check(expr) => def.check(expr.clone()),
                ColumnSpec::Generated { expr, stored } => def.generated(expr.clone(), *stored),
                ColumnSpec::Extra(s) => def.extra(s.clone()),
                ColumnSpec::Comment(s) => def.comment(s.clone()),
                ColumnSpec::Using(expr) => def.using(expr.clone()),
            };
        }
        rebuilt.col(&mut def);
    }
    for index in stmt.get_indexes() {
        rebuilt.index(&mut index.clone());
    }
    for fk in stmt.get_foreign_key_create_stmts() {
        rebuilt.foreign_key(&mut fk.clone());
    }
    rebuilt
}

/// A plausible shipping address for checkout tests.
#[allow(dead_code)]
pub fn test_address() -> Address {
    Address {
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        line1: "12 Analytical Way".to_string(),
        line2: None,
        city: "London".to_string(),
        province: "LDN".to_string(),
        country_code: "GB".to_string(),
        postal_code: "N1 9GU".to_string(),
        phone: None,
    }
}
