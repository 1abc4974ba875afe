use crate::patterns::Regime;
use crate::snapshot::{NetFlow, Snapshot};
use comfy_table::{
    Attribute, Cell, CellAlignment, Color, ContentArrangement, Table, modifiers::UTF8_ROUND_CORNERS,
    presets::UTF8_BORDERS_ONLY,
};

fn regime_color(regime: Regime) -> Color {
    match regime {
        // Taiwanese convention: red is up, green is down.
        Regime::BullishMaCross => Color::Red,
        Regime::BearishMaCross => Color::Green,
        Regime::InsufficientData => Color::DarkGrey,
    }
}

fn flow_cell(flow: NetFlow) -> Cell {
    match flow {
        NetFlow::Lots(v) => {
            let color = if v > 0.0 {
                Color::Red
            } else if v < 0.0 {
                Color::Green
            } else {
                Color::Reset
            };
            Cell::new(format!("{:+.2}", v)).fg(color)
        }
        NetFlow::Unavailable => Cell::new("n/a").fg(Color::DarkGrey),
    }
    .set_alignment(CellAlignment::Right)
}

pub fn build_table(snapshot: &Snapshot) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Code").add_attribute(Attribute::Bold),
            Cell::new("Name").add_attribute(Attribute::Bold),
            Cell::new("Price")
                .add_attribute(Attribute::Bold)
                .set_alignment(CellAlignment::Right),
            Cell::new("Regime").add_attribute(Attribute::Bold),
            Cell::new("Patterns").add_attribute(Attribute::Bold),
            Cell::new("Net flow (lots)")
                .add_attribute(Attribute::Bold)
                .set_alignment(CellAlignment::Right),
        ]);

    for (code, record) in snapshot {
        let patterns = record
            .patterns
            .iter()
            .map(|p| p.label())
            .collect::<Vec<_>>()
            .join(", ");

        table.add_row(vec![
            Cell::new(code).fg(Color::Cyan),
            Cell::new(&record.name),
            Cell::new(format!("{:.2}", record.price)).set_alignment(CellAlignment::Right),
            Cell::new(record.regime).fg(regime_color(record.regime)),
            Cell::new(patterns),
            flow_cell(record.institutional_net_flow),
        ]);
    }

    table
}

pub fn print_summary(snapshot: &Snapshot) {
    if snapshot.is_empty() {
        println!("No symbols were classified in this run.");
        return;
    }

    let date = snapshot
        .values()
        .next()
        .map(|r| r.date.to_string())
        .unwrap_or_default();
    println!("\n(Snapshot of {})\n{}", date, build_table(snapshot));
}
