pub mod order;
pub mod order_exception;
pub mod order_item;
pub mod order_item_instance;
