pub mod conv_block;
