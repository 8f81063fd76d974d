pub mod cart;
pub mod cart_item;
pub mod inventory_movement;
pub mod order;
pub mod order_item;
pub mod order_status_history;
pub mod payment;
pub mod product_variant;

pub use cart::Entity as Cart;
pub use cart_item::Entity as CartItem;
pub use inventory_movement::Entity as InventoryMovement;
pub use order::Entity as Order;
pub use order_item::Entity as OrderItem;
pub use order_status_history::Entity as OrderStatusHistory;
pub use payment::Entity as Payment;
pub use product_variant::Entity as ProductVariant;

pub use cart::Model as CartModel;
pub use order::Model as OrderModel;
pub use product_variant::Model as ProductVariantModel;
